//! Colloquy CLI - AI persona conversations
//!
//! Runs chatbot sessions, two-persona dialogues and board discussions
//! between configured personas, and browses recorded sessions.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colloquy_core::{
    AgentManager, BoardDiscussionScenario, ChatbotScenario, Config, Credentials,
    DialogueScenario, ManagerSettings, Persona, PersonaId, ProviderKind, Scenario, SessionEvent,
    SessionId, SessionOptions, SessionRunner, SqliteTurnStore, TurnKind, TurnStore,
    build_narrator, build_provider,
};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(
    name = "colloquy",
    version,
    about = "Watch AI personas talk to each other",
    long_about = "Run conversations between AI personas backed by Gemini or OpenAI-compatible APIs, with optional narration and SQLite history."
)]
struct Cli {
    /// Configuration file (defaults to ./colloquy.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database for recorded turns
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Project name sessions are filed under
    #[arg(long, global = true, value_name = "NAME")]
    project: Option<String>,

    /// Narrate every reply to a WAV file
    #[arg(long, global = true)]
    narrate: bool,

    /// Use scripted replies instead of calling any provider
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat with a single persona (type /quit to leave)
    Chat {
        /// Persona file
        #[arg(value_name = "PERSONA")]
        persona: PathBuf,
    },
    /// Two personas taking turns
    Dialogue {
        #[arg(value_name = "A")]
        first: PathBuf,
        #[arg(value_name = "B")]
        second: PathBuf,
        /// Total number of turns
        #[arg(short, long, default_value = "10", value_name = "N")]
        turns: usize,
        /// Prompt for the first speaker
        #[arg(
            long,
            default_value = "To impress them, you decided to recite a poem you made on the spot.",
            value_name = "TEXT"
        )]
        opening: String,
        /// Ask whether to continue every K turns
        #[arg(long, value_name = "K")]
        pause_every: Option<usize>,
    },
    /// A board of personas discussing an agenda
    Board {
        /// Persona files, in speaking order
        #[arg(value_name = "PERSONA", num_args = 2..)]
        personas: Vec<PathBuf>,
        #[arg(short, long, default_value = "3", value_name = "R")]
        rounds: usize,
        #[arg(long, value_name = "TEXT")]
        agenda: String,
    },
    /// List recorded sessions, or print one session's turns
    History {
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e.to_string().red());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut config = Config::discover(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.storage.database = db.clone();
    }
    let project_filter = cli.project.clone();
    if let Some(project) = cli.project.clone() {
        config.project = project;
    }
    let credentials = Credentials::from_env();

    match cli.command {
        Command::Chat { ref persona } => {
            let personas = load_personas(&[persona.clone()], cli.dry_run)?;
            let mut runner =
                setup_runner(&cli, &config, &credentials, personas, Box::new(ChatbotScenario))
                    .await?;
            chat_loop(&mut runner).await?;
        }
        Command::Dialogue {
            ref first,
            ref second,
            turns,
            ref opening,
            pause_every,
        } => {
            let personas = load_personas(&[first.clone(), second.clone()], cli.dry_run)?;
            let scenario = Box::new(DialogueScenario::new(turns, opening.clone()));
            let mut runner = setup_runner(&cli, &config, &credentials, personas, scenario).await?;
            dialogue_loop(&mut runner, pause_every).await?;
        }
        Command::Board {
            ref personas,
            rounds,
            ref agenda,
        } => {
            let personas = load_personas(personas, cli.dry_run)?;
            let scenario = Box::new(BoardDiscussionScenario::new(rounds, agenda.clone()));
            let mut runner = setup_runner(&cli, &config, &credentials, personas, scenario).await?;
            print_banner(&format!("Agenda: {}", agenda));
            let board_size = runner.participants().len();
            while !runner.is_finished() {
                runner.run(board_size).await?;
                print_cost(runner.total_cost());
            }
        }
        Command::History { ref session } => {
            let store = SqliteTurnStore::open(&config.storage.database)?;
            match session {
                Some(id) => print_session(&store, &id.parse::<SessionId>()?)?,
                None => print_sessions(&store, project_filter.as_deref())?,
            }
            return Ok(());
        }
    }

    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!("{}", "  Session concluded.".bright_green().bold());
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    Ok(())
}

fn load_personas(paths: &[PathBuf], dry_run: bool) -> CliResult<Vec<Persona>> {
    paths
        .iter()
        .map(|path| -> CliResult<Persona> {
            let mut persona = Persona::load(path)?;
            if dry_run {
                persona.provider = ProviderKind::Scripted;
                persona.model = "scripted".to_string();
            }
            Ok(persona)
        })
        .collect()
}

async fn setup_runner(
    cli: &Cli,
    config: &Config,
    credentials: &Credentials,
    personas: Vec<Persona>,
    scenario: Box<dyn Scenario>,
) -> CliResult<SessionRunner> {
    let mut kinds: Vec<ProviderKind> = personas.iter().map(|p| p.provider).collect();
    kinds.sort_by_key(|k| k.as_str());
    kinds.dedup();

    let providers = kinds
        .into_iter()
        .map(|kind| build_provider(kind, config, credentials))
        .collect::<Result<Vec<_>, _>>()?;

    let mut manager = AgentManager::new(providers, ManagerSettings::from_config(config));
    let ids: Vec<PersonaId> = personas.iter().map(|p| p.id.clone()).collect();

    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!("  {} - {}", "Colloquy".bold(), scenario.display_name())
            .bright_blue()
            .bold()
    );
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    println!("{}", "Participants:".bold());
    for (i, p) in personas.iter().enumerate() {
        println!("  {}. {}", i + 1, p.display_name_with_model().bright_cyan());
    }
    println!();

    for persona in personas {
        manager.register(persona)?;
    }

    let store = SqliteTurnStore::open(&config.storage.database)?;
    let mut runner = SessionRunner::new(
        manager,
        Box::new(store),
        scenario,
        ids,
        SessionOptions::from_config(config),
    )?
    .with_callback(create_console_callback());

    if cli.narrate {
        match build_narrator(config, credentials).await? {
            Some(narrator) => {
                info!(
                    backend = narrator.backend_name(),
                    audio_dir = %config.narration.audio_dir.display(),
                    "narration enabled"
                );
                runner = runner.with_narrator(narrator, config.narration.audio_dir.clone());
            }
            None => {
                warn!("--narrate given but the narration backend is 'none'");
                eprintln!(
                    "{}",
                    "Warning: --narrate given but narration backend is 'none'.".yellow()
                );
            }
        }
    }

    runner.begin()?;
    info!(
        session = %runner.session_id(),
        scenario = runner.scenario().name(),
        database = %config.storage.database.display(),
        "session ready"
    );
    println!("{} {}", "Session:".bold(), runner.session_id().to_string().dimmed());
    println!("{}", "─".repeat(70).dimmed());
    Ok(runner)
}

async fn chat_loop(runner: &mut SessionRunner) -> CliResult<()> {
    let persona = runner.participants()[0].clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Some(input) = prompt_line(&mut lines, "You: ").await? else {
            break;
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" {
            break;
        }
        runner.agent_turn(&persona, input).await?;
        print_cost(runner.total_cost());
    }

    runner.end();
    Ok(())
}

async fn dialogue_loop(runner: &mut SessionRunner, pause_every: Option<usize>) -> CliResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let step = pause_every.filter(|&k| k > 0).unwrap_or(2);

    while !runner.is_finished() {
        runner.run(step).await?;
        print_cost(runner.total_cost());

        if pause_every.is_some() && !runner.is_finished() {
            let question = format!("Continue for {} more turns? (y/n): ", step);
            let answer = prompt_line(&mut lines, &question).await?.unwrap_or_default();
            if !answer.trim().eq_ignore_ascii_case("y") {
                runner.end();
            }
        }
    }
    Ok(())
}

async fn prompt_line(
    lines: &mut Lines<BufReader<Stdin>>,
    prompt: &str,
) -> CliResult<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.bold().to_string().as_bytes()).await?;
    stdout.flush().await?;
    Ok(lines.next_line().await?)
}

/// Create a callback that prints session events to the console.
fn create_console_callback() -> Box<dyn Fn(SessionEvent) + Send + Sync> {
    Box::new(move |event| match event {
        SessionEvent::TurnStart { sequence, name, .. } => {
            println!();
            println!(
                "{} {} {}",
                "▶".bright_cyan(),
                name.bright_cyan().bold(),
                format!("#{}", sequence).dimmed()
            );
        }
        SessionEvent::TurnComplete { turn } => {
            // Keep the persona's own line breaks, wrap each line
            for paragraph in turn.content.lines() {
                let wrapped = textwrap(paragraph, 66);
                for line in wrapped.lines() {
                    println!("  {}", line);
                }
                if paragraph.is_empty() {
                    println!();
                }
            }
        }
        SessionEvent::Narrated { clip, .. } => {
            println!(
                "  {}",
                format!("♪ {} ({:.1}s)", clip.path.display(), clip.duration_secs).dimmed()
            );
        }
        SessionEvent::SessionEnd { turns, .. } => {
            println!();
            println!("{}", format!("{} turns recorded.", turns).dimmed());
        }
    })
}

fn print_banner(text: &str) {
    println!("{}", "═".repeat(70).bright_magenta());
    println!("{}", format!("  {}", text).bright_magenta().bold());
    println!("{}", "═".repeat(70).bright_magenta());
}

fn print_cost(total: f64) {
    println!();
    println!("{}", format!("Total Money ${:.6}", total).yellow());
}

fn print_sessions(store: &dyn TurnStore, project: Option<&str>) -> CliResult<()> {
    let sessions = store.sessions(project)?;
    if sessions.is_empty() {
        println!("No recorded sessions.");
        return Ok(());
    }
    for summary in sessions {
        println!(
            "{}  {}  {}  {}",
            summary.info.id.to_string().bright_cyan(),
            summary.info.started_at.format("%Y-%m-%d %H:%M"),
            format!("{}/{}", summary.info.project, summary.info.scenario).yellow(),
            format!("{} turns", summary.turn_count).dimmed()
        );
    }
    Ok(())
}

fn print_session(store: &dyn TurnStore, session: &SessionId) -> CliResult<()> {
    let turns = store.turns_for_session(session)?;
    if turns.is_empty() {
        println!("No turns recorded for session {}.", session);
        return Ok(());
    }
    for turn in turns {
        let model = match turn.kind {
            TurnKind::Agent => turn.model.clone(),
            TurnKind::Manual => "manual".to_string(),
        };
        println!(
            "{} {} {}",
            format!("#{}", turn.sequence).dimmed(),
            turn.persona_name.bright_cyan().bold(),
            format!("({})", model).dimmed()
        );
        if !turn.prompt.is_empty() {
            println!("  {} {}", "prompt:".dimmed(), turn.prompt.dimmed());
        }
        for line in turn.content.lines() {
            println!("  {}", line);
        }
        if let Some(path) = turn.audio_path.as_deref().map(Path::display) {
            println!("  {}", format!("♪ {}", path).dimmed());
        }
        println!();
    }
    Ok(())
}

/// Simple text wrapping function.
fn textwrap(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut current_line_len = 0;

    for word in text.split_whitespace() {
        if current_line_len + word.len() + 1 > width && current_line_len > 0 {
            result.push('\n');
            current_line_len = 0;
        }
        if current_line_len > 0 {
            result.push(' ');
            current_line_len += 1;
        }
        result.push_str(word);
        current_line_len += word.len();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textwrap_respects_width() {
        let wrapped = textwrap("one two three four five six seven", 10);
        for line in wrapped.lines() {
            assert!(line.len() <= 10);
        }
        assert_eq!(wrapped.split_whitespace().count(), 7);
    }

    #[test]
    fn test_cli_parses_dialogue() {
        let cli = Cli::try_parse_from([
            "colloquy",
            "--dry-run",
            "dialogue",
            "james.toml",
            "john.toml",
            "--turns",
            "4",
            "--pause-every",
            "2",
        ])
        .unwrap();
        assert!(cli.dry_run);
        match cli.command {
            Command::Dialogue {
                turns, pause_every, ..
            } => {
                assert_eq!(turns, 4);
                assert_eq!(pause_every, Some(2));
            }
            _ => panic!("expected dialogue"),
        }
    }

    #[test]
    fn test_board_needs_two_personas() {
        assert!(Cli::try_parse_from(["colloquy", "board", "a.toml", "--agenda", "x"]).is_err());
        assert!(
            Cli::try_parse_from(["colloquy", "board", "a.toml", "b.toml", "--agenda", "x"]).is_ok()
        );
    }
}
