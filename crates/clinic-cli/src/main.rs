mod daemon;
mod output;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use clinic_core::annotate::{annotate, Outcome};
use clinic_core::pipeline::{ARCFACE_MODEL_FILE, SCRFD_MODEL_FILE};
use clinic_core::{CosineMatcher, Embedding, FacePipeline, Matcher, RecognitionReport};
use clinic_hw::Camera;
use clinic_store::{encodings, patients, visits, EmbeddingCipher, NewPatient, NewVisit};
use image::RgbImage;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clinic", version, about = "Clinic face-recognition check-in CLI")]
struct Cli {
    #[command(flatten)]
    paths: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// SQLite database (default: $CLINIC_DB_PATH or ~/.local/share/clinic/clinic.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Face encoding key file (default: $CLINIC_KEY_PATH or ~/.local/share/clinic/encodings.key)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    /// Cosine similarity required for a match, in (0, 1]
    #[arg(
        long,
        global = true,
        env = "CLINIC_SIMILARITY_THRESHOLD",
        default_value_t = clinic_core::DEFAULT_SIMILARITY_THRESHOLD,
        value_parser = parse_threshold
    )]
    threshold: f32,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a patient's face from an image
    Register {
        patient_id: String,
        image: PathBuf,
        /// Create the patient record first with this name
        #[arg(long)]
        name: Option<String>,
        #[arg(long, requires = "name")]
        phone: Option<String>,
        #[arg(long, requires = "name")]
        email: Option<String>,
    },
    /// Identify the patient in an image (JSON output)
    Recognize {
        image: PathBuf,
        /// Write a copy of the image with face boxes and the result banner
        #[arg(long, value_name = "OUT")]
        annotate: Option<PathBuf>,
        /// Record an automated visit for a recognised patient
        #[arg(long)]
        check_in: bool,
    },
    /// Print the face descriptor of an image (JSON output)
    Extract { image: PathBuf },
    /// Manage patient records
    Patient {
        #[command(subcommand)]
        action: PatientCommand,
    },
    /// Manage visit history
    Visit {
        #[command(subcommand)]
        action: VisitCommand,
    },
    /// Manage stored face encodings
    Encoding {
        #[command(subcommand)]
        action: EncodingCommand,
    },
    /// Check that the face models are installed and load
    Check,
    /// Show daemon status
    Status,
    /// Run camera diagnostics
    Test {
        /// V4L2 device to test
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

#[derive(Subcommand)]
enum PatientCommand {
    /// Add a patient without a face encoding
    Add {
        patient_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Show a profile with recent visits
    Show {
        patient_id: String,
        #[arg(long, default_value_t = visits::DEFAULT_VISIT_LIMIT)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// List all patients
    List {
        #[arg(long)]
        json: bool,
    },
    /// Update contact details
    Update {
        patient_id: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
}

#[derive(Subcommand)]
enum VisitCommand {
    /// Record a visit
    Add {
        patient_id: String,
        #[arg(long)]
        purpose: Option<String>,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        prescription: Option<String>,
    },
    /// List recent visits
    List {
        patient_id: String,
        #[arg(long, default_value_t = visits::DEFAULT_VISIT_LIMIT)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum EncodingCommand {
    /// List patients with a registered face
    List,
    /// Remove a patient's face encoding
    Remove { patient_id: String },
}

fn parse_threshold(value: &str) -> Result<f32, String> {
    let threshold: f32 = value.parse().map_err(|e| format!("{e}"))?;
    if !clinic_core::is_valid_threshold(threshold) {
        return Err(format!("{value} is not in (0, 1]"));
    }
    Ok(threshold)
}

impl GlobalArgs {
    fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(clinic_store::default_db_path)
    }

    fn key_path(&self) -> PathBuf {
        self.key.clone().unwrap_or_else(clinic_store::default_key_path)
    }

    fn model_dir(&self) -> PathBuf {
        self.models.clone().unwrap_or_else(clinic_core::default_model_dir)
    }

    fn open_db(&self) -> Result<Connection> {
        let path = self.db_path();
        clinic_store::open(&path).with_context(|| format!("opening database {}", path.display()))
    }

    fn cipher(&self) -> Result<EmbeddingCipher> {
        let path = self.key_path();
        EmbeddingCipher::load_or_create(&path)
            .with_context(|| format!("loading key {}", path.display()))
    }

    fn pipeline(&self) -> Result<FacePipeline> {
        let dir = self.model_dir();
        FacePipeline::load(&dir).with_context(|| format!("loading models from {}", dir.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let g = &cli.paths;

    match cli.command {
        Commands::Register {
            patient_id,
            image,
            name,
            phone,
            email,
        } => {
            let frame = load_image(&image)?;
            let mut pipeline = g.pipeline()?;

            println!("Extracting face features for patient: {patient_id}");
            let sample = pipeline
                .embed_primary(&frame)?
                .context("Could not detect face in image")?;

            let new_patient = name.map(|name| NewPatient {
                patient_id: patient_id.clone(),
                name,
                phone,
                email,
            });
            save_registration(g, patient_id.trim(), new_patient, &sample.embedding)?;
            println!(
                "Success: Face registered for patient {} (detection confidence {:.2})",
                patient_id.trim(),
                sample.face.confidence
            );
            daemon::notify_gallery_changed().await;
        }

        Commands::Recognize {
            image,
            annotate: annotate_out,
            check_in,
        } => {
            let report = match recognize(g, &image, annotate_out.as_deref(), check_in) {
                Ok(report) => report,
                Err(e) => {
                    println!("{}", RecognitionReport::failure(format!("{e:#}")).to_json());
                    std::process::exit(1);
                }
            };
            println!("{}", report.to_json());
        }

        Commands::Extract { image } => {
            let result = load_image(&image).and_then(|frame| {
                g.pipeline()?
                    .embed_primary(&frame)?
                    .context("Could not detect face in image")
            });
            match result {
                Ok(sample) => println!("{}", output::extract_json(&sample.embedding.values)),
                Err(e) => {
                    println!("{}", output::error_json(&format!("{e:#}")));
                    std::process::exit(1);
                }
            }
        }

        Commands::Patient { action } => run_patient(g, action)?,
        Commands::Visit { action } => run_visit(g, action)?,

        Commands::Encoding { action } => {
            let conn = g.open_db()?;
            match action {
                EncodingCommand::List => {
                    let ids = encodings::list_ids(&conn)?;
                    if ids.is_empty() {
                        println!("No face encodings registered");
                    }
                    for id in ids {
                        println!("{id}");
                    }
                }
                EncodingCommand::Remove { patient_id } => {
                    if !encodings::delete(&conn, &patient_id)? {
                        bail!("No face encoding for patient {patient_id}");
                    }
                    println!("Removed face encoding for {patient_id}");
                    daemon::notify_gallery_changed().await;
                }
            }
        }

        Commands::Check => run_check(g)?,

        Commands::Status => {
            let proxy = daemon::connect()
                .await
                .context("connecting to the session bus")?;
            let status = proxy.status().await.context("clinicd is not running")?;
            println!("{status}");
            let current = proxy.current_patient().await?;
            if !current.is_empty() {
                println!("{current}");
            }
        }

        Commands::Test { device, frames } => run_camera_test(&device, frames)?,
    }

    Ok(())
}

fn load_image(path: &Path) -> Result<RgbImage> {
    if !path.exists() {
        bail!("Image file not found: {}", path.display());
    }
    let img = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    Ok(img.to_rgb8())
}

/// Store a registered face, creating the patient first when `new_patient` is given.
fn save_registration(
    g: &GlobalArgs,
    patient_id: &str,
    new_patient: Option<NewPatient>,
    embedding: &Embedding,
) -> Result<()> {
    let mut conn = g.open_db()?;
    let cipher = g.cipher()?;
    match new_patient {
        Some(new) => {
            let patient = encodings::enroll(&mut conn, &cipher, &new, embedding)?;
            println!("Added patient {} ({})", patient.name, patient.patient_id);
        }
        None => encodings::save(&conn, &cipher, patient_id, embedding)?,
    }
    Ok(())
}

fn recognize(
    g: &GlobalArgs,
    image: &Path,
    annotate_out: Option<&Path>,
    check_in: bool,
) -> Result<RecognitionReport> {
    let mut frame = load_image(image)?;
    let analysis = g.pipeline()?.analyze(&frame)?;

    let (report, outcome) = match &analysis.sample {
        None => (RecognitionReport::no_face(), Outcome::Scanning),
        Some(sample) => {
            let conn = g.open_db()?;
            let gallery = encodings::load_gallery(&conn, &g.cipher()?)?;
            let result = CosineMatcher.compare(&sample.embedding, &gallery, g.threshold);
            tracing::info!(
                matched = result.matched,
                similarity = result.similarity,
                gallery = gallery.len(),
                "recognition result"
            );

            if check_in {
                if let Some(id) = result.patient_id.as_deref().filter(|_| result.matched) {
                    visits::record(&conn, &NewVisit::check_in(id))?;
                }
            }

            let outcome = if result.matched {
                Outcome::Recognized {
                    similarity: result.similarity,
                }
            } else {
                Outcome::Unknown {
                    similarity: result.similarity,
                }
            };
            (RecognitionReport::from_match(&result), outcome)
        }
    };

    if let Some(out) = annotate_out {
        annotate(&mut frame, &analysis.faces, outcome);
        frame
            .save(out)
            .with_context(|| format!("writing {}", out.display()))?;
    }

    Ok(report)
}

fn run_patient(g: &GlobalArgs, action: PatientCommand) -> Result<()> {
    let conn = g.open_db()?;
    match action {
        PatientCommand::Add {
            patient_id,
            name,
            phone,
            email,
        } => {
            let patient = patients::insert(
                &conn,
                &NewPatient {
                    patient_id,
                    name,
                    phone,
                    email,
                },
            )?;
            println!("Patient {} successfully registered!", patient.name);
        }
        PatientCommand::Show {
            patient_id,
            limit,
            json,
        } => {
            let Some(patient) = patients::get(&conn, &patient_id)? else {
                bail!("Patient {patient_id} not found in database");
            };
            let recent = visits::recent(&conn, &patient_id, limit)?;
            if json {
                println!(
                    "{}",
                    output::pretty(&output::ProfileOutput {
                        patient: &patient,
                        visits: &recent,
                    })
                );
            } else {
                println!("{}", output::format_profile(&patient, &recent));
            }
        }
        PatientCommand::List { json } => {
            let all = patients::list(&conn)?;
            if json {
                println!("{}", output::pretty(&all));
            } else {
                println!("{}", output::format_patient_list(&all));
            }
        }
        PatientCommand::Update {
            patient_id,
            phone,
            email,
        } => {
            if phone.is_none() && email.is_none() {
                bail!("Nothing to update: pass --phone and/or --email");
            }
            let patient =
                patients::update_contact(&conn, &patient_id, phone.as_deref(), email.as_deref())?;
            println!("Updated {} ({})", patient.name, patient.patient_id);
        }
    }
    Ok(())
}

fn run_visit(g: &GlobalArgs, action: VisitCommand) -> Result<()> {
    let conn = g.open_db()?;
    match action {
        VisitCommand::Add {
            patient_id,
            purpose,
            notes,
            prescription,
        } => {
            let visit = NewVisit::manual(
                &patient_id,
                purpose.as_deref(),
                notes.as_deref(),
                prescription.as_deref(),
            );
            visits::record(&conn, &visit)?;
            println!("Visit record added successfully for {patient_id}");
        }
        VisitCommand::List {
            patient_id,
            limit,
            json,
        } => {
            if !patients::exists(&conn, &patient_id)? {
                bail!("Patient {patient_id} not found in database");
            }
            let recent = visits::recent(&conn, &patient_id, limit)?;
            if json {
                println!("{}", output::pretty(&recent));
            } else {
                println!("{}", output::format_visits(&recent));
            }
        }
    }
    Ok(())
}

fn run_check(g: &GlobalArgs) -> Result<()> {
    let dir = g.model_dir();
    println!("Model directory: {}", dir.display());
    for file in [SCRFD_MODEL_FILE, ARCFACE_MODEL_FILE] {
        let status = if dir.join(file).is_file() { "found" } else { "missing" };
        println!("  {file}: {status}");
    }

    g.pipeline()?;
    println!("Face models loaded successfully");
    Ok(())
}

fn run_camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = Camera::open(device, 1280, 720)?;
    println!(
        "\n{device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let (captured, dark) = camera.capture_frames(frames.max(1))?;
    let brightness = if captured.is_empty() {
        0.0
    } else {
        captured.iter().map(|f| f.avg_brightness()).sum::<f32>() / captured.len() as f32
    };
    println!(
        "Captured {} frame(s), {} dark, average brightness {:.1}",
        captured.len(),
        dark,
        brightness
    );
    if captured.is_empty() {
        bail!("no usable frames from {device}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "clinic",
            "recognize",
            "face.jpg",
            "--threshold",
            "0.7",
            "--db",
            "/tmp/c.db",
            "--check-in",
        ])
        .unwrap();
        assert_eq!(cli.paths.threshold, 0.7);
        assert_eq!(cli.paths.db_path(), PathBuf::from("/tmp/c.db"));
        assert!(matches!(
            cli.command,
            Commands::Recognize { check_in: true, annotate: None, .. }
        ));
    }

    #[test]
    fn test_register_contact_requires_name() {
        assert!(
            Cli::try_parse_from(["clinic", "register", "PAT001", "a.jpg", "--phone", "1"]).is_err()
        );
        assert!(Cli::try_parse_from([
            "clinic", "register", "PAT001", "a.jpg", "--name", "Ada", "--phone", "1"
        ])
        .is_ok());
    }

    #[test]
    fn test_visit_list_default_limit() {
        let cli = Cli::try_parse_from(["clinic", "visit", "list", "PAT001"]).unwrap();
        match cli.command {
            Commands::Visit {
                action: VisitCommand::List { limit, json, .. },
            } => {
                assert_eq!(limit, 10);
                assert!(!json);
            }
            _ => panic!("parsed wrong command"),
        }
    }

    #[test]
    fn test_missing_image_message() {
        let err = load_image(Path::new("/nonexistent/face.jpg")).unwrap_err();
        assert_eq!(err.to_string(), "Image file not found: /nonexistent/face.jpg");
    }

    #[test]
    fn test_patient_and_visit_commands_share_database() {
        let dir = std::env::temp_dir().join(format!("clinic-cli-test-{}", std::process::id()));
        let db = dir.join("clinic.db");
        let parse = |args: &[&str]| {
            let mut full = vec![
                "clinic".to_string(),
                "--db".to_string(),
                db.to_string_lossy().into_owned(),
            ];
            full.extend(args.iter().map(|a| a.to_string()));
            Cli::try_parse_from(full).unwrap()
        };

        let cli = parse(&["patient", "add", "PAT001", "--name", "Ada Lovelace"]);
        let Commands::Patient { action } = cli.command else { panic!() };
        run_patient(&cli.paths, action).unwrap();

        let cli = parse(&["visit", "add", "PAT001", "--notes", "first visit"]);
        let Commands::Visit { action } = cli.command else { panic!() };
        run_visit(&cli.paths, action).unwrap();

        let conn = clinic_store::open(&db).unwrap();
        let recent = visits::recent(&conn, "PAT001", 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].purpose, visits::DEFAULT_PURPOSE);

        let cli = parse(&["visit", "list", "PAT404"]);
        let Commands::Visit { action } = cli.command else { panic!() };
        assert!(run_visit(&cli.paths, action).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        for bad in ["NaN", "1.5", "0", "-0.3", "inf"] {
            assert!(
                Cli::try_parse_from(["clinic", "--threshold", bad, "status"]).is_err(),
                "accepted {bad}"
            );
        }
        let cli = Cli::try_parse_from(["clinic", "--threshold", "1", "status"]).unwrap();
        assert_eq!(cli.paths.threshold, 1.0);
    }

    #[test]
    fn test_check_reports_missing_model() {
        let cli = Cli::try_parse_from(["clinic", "check", "--models", "/nonexistent/models"]).unwrap();
        assert!(matches!(cli.command, Commands::Check));
        let err = run_check(&cli.paths).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("/nonexistent/models/det_10g.onnx"), "{message}");
    }

    #[test]
    fn test_failed_registration_leaves_no_patient() {
        let dir = std::env::temp_dir().join(format!("clinic-cli-enroll-{}", std::process::id()));
        let args = |key: &str| {
            let full = [
                "clinic".to_string(),
                "--db".to_string(),
                dir.join("clinic.db").to_string_lossy().into_owned(),
                "--key".to_string(),
                dir.join(key).to_string_lossy().into_owned(),
                "status".to_string(),
            ];
            Cli::try_parse_from(full).unwrap().paths
        };
        let face = Embedding::new(vec![0.6, 0.8]);
        let new = |id: &str| NewPatient {
            patient_id: id.into(),
            name: format!("Patient {id}"),
            ..Default::default()
        };

        let good = args("good.key");
        save_registration(&good, "PAT001", Some(new("PAT001")), &face).unwrap();

        // The database is bound to good.key; a second key must not leave a stray patient.
        let wrong = args("wrong.key");
        assert!(save_registration(&wrong, "PAT002", Some(new("PAT002")), &face).is_err());
        let conn = good.open_db().unwrap();
        assert!(!patients::exists(&conn, "PAT002").unwrap());

        save_registration(&good, "PAT002", Some(new("PAT002")), &face).unwrap();
        assert_eq!(encodings::list_ids(&conn).unwrap(), vec!["PAT001", "PAT002"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
