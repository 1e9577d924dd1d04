use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};

mod client;
mod fsm;

use client::GateClient;
use fsm::{Effect, Event, Machine, State, DISPLAY_WINDOW, VERIFY_TIMEOUT};

#[derive(Parser)]
#[command(name = "passage-kiosk", about = "Passage gate kiosk — verification capture loop")]
struct Cli {
    /// Base URL of the gate daemon
    #[arg(long, default_value = "http://localhost:8080")]
    server: String,

    /// Gate location label attached to every attempt
    #[arg(long, default_value = "Main Gate")]
    gate_location: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture loop against a directory of camera frames
    Run {
        /// Directory of JPEG frames produced by the camera pipeline
        #[arg(long)]
        frames: PathBuf,
        /// Delay between analyzed frames, in milliseconds
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// One-shot verification of an image file
    Verify {
        image: PathBuf,
    },
    /// Mark attendance for a student
    Mark {
        student_id: String,
        /// Confidence to record; the daemon applies its manual
        /// default when omitted
        #[arg(short, long)]
        confidence: Option<f64>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Arc::new(GateClient::new(cli.server, cli.gate_location));

    match cli.command {
        Commands::Run {
            frames,
            interval_ms,
        } => run_loop(client, frames, Duration::from_millis(interval_ms)).await,
        Commands::Verify { image } => verify_once(&client, &image).await,
        Commands::Mark {
            student_id,
            confidence,
        } => {
            let reply = client
                .mark_attendance(&student_id, confidence.unwrap_or(0.9))
                .await?;
            println!(
                "{}: {}",
                if reply.success { "marked" } else { "not marked" },
                reply.message
            );
            Ok(())
        }
        Commands::Status => {
            let status = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

async fn verify_once(client: &GateClient, path: &PathBuf) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    image::load_from_memory(&bytes).context("file is not a decodable image")?;

    match client.verify(bytes).await? {
        fsm::VerifyReply::Matched(student) => {
            println!(
                "match: {} ({}) confidence {:.2} — not yet marked today",
                student.name, student.student_id, student.confidence
            );
        }
        fsm::VerifyReply::AlreadyMarked {
            student,
            attendance_time,
        } => {
            println!(
                "match: {} ({}) — already marked today{}",
                student.name,
                student.student_id,
                attendance_time
                    .map(|t| format!(" at {t}"))
                    .unwrap_or_default()
            );
        }
        fsm::VerifyReply::NotRecognized { message } => println!("no match: {message}"),
    }
    Ok(())
}

/// Drive the capture-loop machine: a frame-analysis stream feeds
/// liveness verdicts in, effects fan out as spawned calls, and their
/// results come back as events. Stdin is the operator panel:
/// `m` marks, `c` cancels.
async fn run_loop(client: Arc<GateClient>, frames_dir: PathBuf, interval: Duration) -> Result<()> {
    let frames = frame_paths(&frames_dir)?;
    if frames.is_empty() {
        bail!("no .jpg frames in {}", frames_dir.display());
    }

    let (tx, mut rx) = mpsc::channel::<Event>(32);
    let latest_frame: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));

    spawn_frame_stream(frames, interval, tx.clone(), latest_frame.clone());
    spawn_operator_input(tx.clone());

    println!("kiosk ready — 'm' marks attendance, 'c' cancels");

    let mut machine = Machine::new();
    let mut shown: Option<State> = None;

    while let Some(event) = rx.recv().await {
        for effect in machine.step(event) {
            match effect {
                Effect::StartVerify { generation } => {
                    let image = latest_frame.lock().await.clone();
                    let Some(image) = image else {
                        let _ = tx
                            .send(Event::VerifyFailed {
                                generation,
                                message: "no frame captured".into(),
                            })
                            .await;
                        continue;
                    };
                    let client = client.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let event =
                            match tokio::time::timeout(VERIFY_TIMEOUT, client.verify(image)).await
                            {
                                Ok(Ok(reply)) => Event::VerifyFinished { generation, reply },
                                Ok(Err(err)) => Event::VerifyFailed {
                                    generation,
                                    message: err.to_string(),
                                },
                                Err(_) => Event::VerifyTimedOut { generation },
                            };
                        let _ = tx.send(event).await;
                    });
                }
                Effect::StartMark {
                    generation,
                    student_id,
                    confidence,
                } => {
                    let client = client.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let event = match client.mark_attendance(&student_id, confidence).await {
                            Ok(reply) => Event::MarkFinished {
                                generation,
                                success: reply.success,
                                message: reply.message,
                            },
                            Err(err) => Event::MarkFailed {
                                generation,
                                message: format!("Failed to mark attendance: {err}"),
                            },
                        };
                        let _ = tx.send(event).await;
                    });
                }
                Effect::StartDisplayTimer { generation } => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(DISPLAY_WINDOW).await;
                        let _ = tx.send(Event::DisplayElapsed { generation }).await;
                    });
                }
            }
        }

        if shown.as_ref() != Some(machine.state()) {
            render(machine.state());
            shown = Some(machine.state().clone());
        }
    }
    Ok(())
}

fn frame_paths(dir: &PathBuf) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("jpg") | Some("jpeg")
            )
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Stand-in for the camera + external face detector: cycles the frame
/// directory at the analysis rate. A frame is live when its sidecar
/// `<name>.liveness` (two eye-open probabilities from the detector)
/// clears the floor, or, without a sidecar, when it decodes as an
/// image at all.
fn spawn_frame_stream(
    frames: Vec<PathBuf>,
    interval: Duration,
    tx: mpsc::Sender<Event>,
    latest: Arc<Mutex<Option<Vec<u8>>>>,
) {
    tokio::spawn(async move {
        let mut idx = 0usize;
        loop {
            let path = frames[idx % frames.len()].clone();
            idx += 1;

            let live = match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let decodable = image::load_from_memory(&bytes).is_ok();
                    // Frames without a sidecar carry no eye signal;
                    // the harness counts them live on decodability.
                    let live = decodable
                        && read_liveness_sidecar(&path)
                            .await
                            .map_or(true, |(l, r)| fsm::is_live(l, r));
                    if live {
                        *latest.lock().await = Some(bytes);
                    }
                    live
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "frame read failed");
                    false
                }
            };

            if tx.send(Event::FrameAnalyzed { live }).await.is_err() {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    });
}

/// `None` means no sidecar — the detector gave no eye signal for this
/// frame and the frame counts as live on decodability alone.
async fn read_liveness_sidecar(frame: &PathBuf) -> Option<(f32, f32)> {
    let sidecar = frame.with_extension("liveness");
    let text = tokio::fs::read_to_string(sidecar).await.ok()?;
    let mut parts = text.split_whitespace();
    let left = parts.next()?.parse().ok()?;
    let right = parts.next()?.parse().ok()?;
    Some((left, right))
}

fn spawn_operator_input(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match line.trim() {
                "m" | "mark" => Event::OperatorMark,
                "c" | "cancel" => Event::OperatorCancel,
                _ => continue,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
}

fn render(state: &State) {
    match state {
        State::Idle => println!("[idle] awaiting face"),
        State::Verifying { .. } => println!("[verifying] checking against enrolled students..."),
        State::Matched { student, .. } => println!(
            "[match] {} ({}) confidence {:.2} — 'm' to mark attendance, 'c' to cancel",
            student.name, student.student_id, student.confidence
        ),
        State::Marking { student, .. } => {
            println!("[marking] recording attendance for {}...", student.name);
        }
        State::Confirmed { message, .. } => println!("[ok] {message}"),
        State::Rejected { message, .. } => println!("[rejected] {message}"),
    }
}
