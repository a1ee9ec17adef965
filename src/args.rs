// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use clap::{
    Parser, Subcommand,
    error::{Error, ErrorKind},
};
use reqwest::Client;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

use crate::download::DownloadOptions;
use crate::range::RangeRequest;
use crate::server::DEFAULT_CHUNK_SIZE;

#[derive(Error, Debug)]
pub enum ArgsError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
    #[error("--end {end} is before --start {start}")]
    InvertedRange { start: u64, end: u64 },
}

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about,
    long_about = "Serve a media file with HTTP range requests, or download one progressively"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve a single media file with range request support
    Serve(ServeArgs),
    /// Download a media file while reporting transfer, buffer and play progress
    Fetch(FetchArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Media file to serve
    pub file: PathBuf,

    /// Address to listen on
    #[arg(long, short, default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Path the file is served at
    #[arg(long, short, default_value = "/video", value_parser = parse_route)]
    pub route: String,

    /// Content-Type header value; derived from the file extension if unset
    #[arg(long)]
    pub content_type: Option<String>,

    /// Bytes read from disk per streamed chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_parser = parse_greater_than_zero)]
    pub chunk_size: usize,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FetchArgs {
    /// URL of the media resource
    pub url: String,

    /// File the downloaded bytes are written to
    #[arg(long, short, default_value = "downloaded_media")]
    pub output: PathBuf,

    /// First byte to fetch; turns the download into a range request
    #[arg(long)]
    pub start: Option<u64>,

    /// Last byte to fetch, inclusive
    #[arg(long, requires = "start")]
    pub end: Option<u64>,

    /// Media duration in seconds, used to report buffer and play progress
    #[arg(long, value_parser = parse_positive_seconds)]
    pub duration: Option<f64>,

    /// Number of attempts per transfer session
    #[arg(long, default_value_t = 5, value_parser = parse_greater_than_zero)]
    pub max_retries: usize,

    /// Connect timeout in seconds
    #[arg(long, default_value = "30", value_parser = parse_duration_seconds)]
    pub connect_timeout: Duration,

    /// Longest wait for data, in seconds, before an attempt fails
    #[arg(long, default_value = "30", value_parser = parse_duration_seconds)]
    pub stall_timeout: Duration,

    /// Play position sampling period in milliseconds
    #[arg(long, default_value = "200", value_parser = parse_duration_millis)]
    pub sample_interval: Duration,

    /// Disable progress bar output
    #[arg(long, short, default_value_t = false)]
    pub quiet: bool,

    /// Print the final progress snapshot as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// User-Agent string for HTTP requests
    #[arg(long, short, default_value_t = concat!("range-streamer/",
        env!("CARGO_PKG_VERSION_MAJOR"),
        ".",
        env!("CARGO_PKG_VERSION_MINOR")).to_string())]
    pub user_agent: String,
}

impl FetchArgs {
    /// The window to fetch, or `None` for the whole resource.
    pub fn window(&self) -> Result<Option<RangeRequest>, ArgsError> {
        let Some(start) = self.start else {
            return Ok(None);
        };
        if let Some(end) = self.end
            && end < start
        {
            return Err(ArgsError::InvertedRange { start, end });
        }
        Ok(Some(RangeRequest {
            start,
            end: self.end,
        }))
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            max_retries: self.max_retries,
            stall_timeout: self.stall_timeout,
            ..DownloadOptions::default()
        }
    }

    pub fn build_client(&self) -> Result<Client, ArgsError> {
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(&self.user_agent)
            .build()?;
        Ok(client)
    }
}

fn parse_greater_than_zero(s: &str) -> Result<usize, Error> {
    let v = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid integer"),
        )
    })?;
    if v == 0 {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be greater than 0",
        ))
    } else {
        Ok(v)
    }
}

fn parse_duration_seconds(s: &str) -> Result<Duration, Error> {
    let seconds = parse_greater_than_zero(s)?;
    Ok(Duration::from_secs(seconds as u64))
}

fn parse_duration_millis(s: &str) -> Result<Duration, Error> {
    let millis = parse_greater_than_zero(s)?;
    Ok(Duration::from_millis(millis as u64))
}

fn parse_positive_seconds(s: &str) -> Result<f64, Error> {
    let v: f64 = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid number"),
        )
    })?;
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be a finite number greater than 0",
        ))
    }
}

fn parse_route(s: &str) -> Result<String, Error> {
    if s.starts_with('/') {
        Ok(s.to_string())
    } else {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` must start with `/`"),
        ))
    }
}

pub fn parse_args() -> Args {
    Args::parse()
}
