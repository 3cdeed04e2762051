use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn enroll(
        &self,
        id: &str,
        full_name: &str,
        department: &str,
        images: Vec<Vec<u8>>,
    ) -> zbus::Result<String>;
    fn recognize(&self, image: Vec<u8>) -> zbus::Result<String>;
    fn list_users(&self) -> zbus::Result<String>;
    fn attendance_logs(&self, limit: u32) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a person from one or more photos
    Enroll {
        /// Identity id, e.g. an employee number
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long = "dept", default_value = "")]
        department: String,
        /// Photo files (JPEG or PNG)
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize a single frame and record attendance
    Recognize {
        image: PathBuf,
    },
    /// List enrolled people
    Users,
    /// Show the latest check-ins
    Logs {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
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

    let connection = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("could not connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            department,
            images,
        } => {
            let images = images
                .iter()
                .map(|path| std::fs::read(path).with_context(|| format!("reading {}", path.display())))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(id = %id, count = images.len(), "sending enrollment");
            let reply: Value = serde_json::from_str(&proxy.enroll(&id, &name, &department, images).await?)?;
            println!(
                "Enrolled {} from {} image(s) ({} without a usable face)",
                reply["identity_id"].as_str().unwrap_or(&id),
                reply["used"],
                reply["skipped"],
            );
        }
        Commands::Recognize { image } => {
            let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let reply: Value = serde_json::from_str(&proxy.recognize(bytes).await?)?;
            println!("{}", describe_recognition(&reply));
        }
        Commands::Users => {
            let users: Value = serde_json::from_str(&proxy.list_users().await?)?;
            print_rows(&users, &["id", "full_name", "department", "is_verified"]);
        }
        Commands::Logs { limit } => {
            let logs: Value = serde_json::from_str(&proxy.attendance_logs(limit).await?)?;
            print_rows(
                &logs,
                &["check_in_time", "identity_id", "full_name", "status", "confidence"],
            );
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

fn describe_recognition(reply: &Value) -> String {
    let identity = reply["identity"].as_str().unwrap_or("Unknown");
    let confidence = reply["confidence"].as_f64().unwrap_or(0.0);
    let message = reply["attendance_message"].as_str().unwrap_or("");
    let mut line = if reply["identity_id"].is_string() {
        format!("{identity} ({:.0}%)", confidence * 100.0)
    } else {
        identity.to_string()
    };
    if !message.is_empty() {
        line.push_str(": ");
        line.push_str(message);
    }
    line
}

fn print_rows(rows: &Value, columns: &[&str]) {
    match rows.as_array() {
        Some(rows) if !rows.is_empty() => {
            for line in render_rows(rows, columns) {
                println!("{line}");
            }
        }
        _ => println!("(none)"),
    }
}

fn render_rows(rows: &[Value], columns: &[&str]) -> Vec<String> {
    let cell = |row: &Value, col: &str| match &row[col] {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in rows {
        for (i, col) in columns.iter().enumerate() {
            widths[i] = widths[i].max(cell(row, col).len());
        }
    }

    let line = |cells: Vec<String>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(columns.iter().map(|c| c.to_string()).collect())];
    out.extend(rows.iter().map(|row| line(columns.iter().map(|c| cell(row, c)).collect())));
    out
}
