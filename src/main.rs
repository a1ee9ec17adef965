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

use indicatif::ProgressStyle;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Span;
use tracing_indicatif::{IndicatifLayer, span_ext::IndicatifSpanExt as _};
use tracing_subscriber::{
    EnvFilter, Layer as _, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

use range_streamer::{
    args::{Command, FetchArgs, parse_args},
    controller::StreamController,
    download::TransferOutcome,
    playback::{
        ConstantBitrateTimeline, MediaTimeline, UnknownTimeline, WallClockPosition,
        spawn_position_sampler,
    },
    progress::{ProgressAggregator, ProgressSnapshot, spawn_aggregator},
    server,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let indicatif_layer = IndicatifLayer::new().with_progress_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar}] {bytes:>9}/{total_bytes:9} ({percent:>3}%) {msg}",
        )?
        .progress_chars("#>-"),
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_target(false)
                .with_filter(filter),
        )
        .with(indicatif_layer)
        .init();

    // Handle ctrl-c
    let token = CancellationToken::new();
    tokio::task::spawn({
        let token = token.clone();
        async move {
            _ = tokio::signal::ctrl_c().await;
            token.cancel();
        }
    });

    match args.command {
        Command::Serve(args) => server::run(&args, token).await?,
        Command::Fetch(args) => fetch(&args, token).await?,
    }
    Ok(())
}

async fn fetch(
    args: &FetchArgs,
    token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = args.build_client()?;
    let window = args.window()?;

    let timeline: Box<dyn MediaTimeline> = match args.duration {
        Some(duration) => Box::new(ConstantBitrateTimeline::new(duration)),
        None => Box::new(UnknownTimeline),
    };
    let (events, receiver) = mpsc::unbounded_channel();
    let (aggregator, snapshots) = spawn_aggregator(ProgressAggregator::new(timeline), receiver);

    // Simulated playback only advances over buffered media.
    let position = args
        .duration
        .map(|duration| Arc::new(WallClockPosition::buffering(duration)));
    let sampler_token = token.child_token();
    let sampler = position.clone().map(|position| {
        spawn_position_sampler(
            position,
            events.clone(),
            args.sample_interval,
            sampler_token.clone(),
        )
    });

    let span = tracing::info_span!("fetch");
    if !args.quiet {
        span.pb_start();
    }
    let display = tokio::spawn(show_progress(snapshots, span.clone(), position));

    let mut controller = StreamController::new(
        client,
        args.url.clone(),
        args.output.clone(),
        args.download_options(),
        events,
        token,
    );
    controller.start(window).await;
    let report = controller.wait().await;

    // The aggregator finishes once every sender is gone.
    sampler_token.cancel();
    if let Some(sampler) = sampler {
        _ = sampler.await;
    }
    drop(controller);
    let snapshot = aggregator.await?;
    _ = display.await;
    drop(span);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    match report.map(|report| report.outcome) {
        Some(TransferOutcome::Failed(err)) => Err(err.into()),
        Some(TransferOutcome::Cancelled) => {
            tracing::warn!("download cancelled");
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn show_progress(
    mut snapshots: watch::Receiver<ProgressSnapshot>,
    span: Span,
    position: Option<Arc<WallClockPosition>>,
) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Some(position) = &position
            && let Some(fraction) = snapshot.buffer_fraction
        {
            position.set_buffered_fraction(fraction);
        }
        if let Some(expected) = snapshot.expected {
            span.pb_set_length(expected);
        }
        span.pb_set_position(snapshot.received);
        span.pb_set_message(&describe(&snapshot));
    }
}

fn describe(snapshot: &ProgressSnapshot) -> String {
    let percent = |fraction: Option<f64>| {
        fraction.map_or_else(|| "-".to_string(), |f| format!("{:.0}%", f * 100.0))
    };
    format!(
        "buffered {} played {}",
        percent(snapshot.buffer_fraction),
        percent(snapshot.play_fraction)
    )
}
