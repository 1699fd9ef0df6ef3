use agentline::transport::http::{HttpConfig, HttpTransport, resolve_token};
use agentline::{Client, ConsoleWriter, SessionConfig};
use clap::Parser;
use std::error::Error;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

type MainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const RULE_WIDTH: usize = 80;

#[derive(Debug, Parser)]
#[command(name = "agentline", about = "Run one task in a remote agent session and stream its output")]
struct Args {
    /// Task prompt; `-` or nothing reads it from stdin.
    prompt: Option<String>,

    #[arg(long, env = "AGENTLINE_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    #[arg(long, env = "AGENTLINE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "AGENTLINE_MODEL", default_value = "claude-sonnet-4.5")]
    model: String,

    /// Skill directory handed to the backend; repeatable.
    #[arg(long = "skill-dir")]
    skill_dirs: Vec<String>,

    #[arg(long)]
    no_streaming: bool,

    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,

    /// Folder the agent writes its results into; created when missing.
    #[arg(long, default_value = "blog")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let prompt = read_prompt(args.prompt.as_deref())?;
    announce_output_dir(&args.output_dir)?;

    let client = Client::new(HttpTransport::new(HttpConfig {
        base_url: args.url.clone(),
        token: resolve_token(args.token.clone()),
    }));
    client.start().await?;

    let result = run(&client, &args, prompt).await;
    client.stop().await;
    result
}

async fn run(client: &Client, args: &Args, prompt: String) -> MainResult<()> {
    let mut config = SessionConfig::new(args.model.clone()).with_streaming(!args.no_streaming);
    for dir in &args.skill_dirs {
        config = config.with_skill_directory(dir.clone());
    }

    let session = client.create_session(config).await?;
    println!("✓ Session created with ID: {}", session.id());
    banner("Starting task...");

    session.on(ConsoleWriter::stdout());
    session
        .send_and_wait(prompt, Duration::from_secs(args.timeout_secs))
        .await?;

    banner("Task complete!");
    Ok(())
}

fn init_tracing() {
    // stdout carries the agent output; logs go to stderr.
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn read_prompt(arg: Option<&str>) -> MainResult<String> {
    let prompt = match arg {
        Some(prompt) if prompt != "-" => prompt.to_string(),
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    if prompt.trim().is_empty() {
        return Err("empty prompt".into());
    }
    Ok(prompt)
}

fn announce_output_dir(dir: &Path) -> MainResult<()> {
    if ensure_dir(dir)? {
        println!("✓ Created output folder at: {}", dir.display());
    } else {
        println!("✓ Output folder exists at: {}", dir.display());
    }
    Ok(())
}

/// Returns true when the directory had to be created.
fn ensure_dir(dir: &Path) -> std::io::Result<bool> {
    if dir.is_dir() {
        return Ok(false);
    }
    std::fs::create_dir_all(dir)?;
    Ok(true)
}

fn banner(title: &str) {
    let rule = "=".repeat(RULE_WIDTH);
    println!("\n{}\n{}\n{}\n", rule, title, rule);
}
