#![deny(warnings)]

//! Headless CLI for managing an agency save and reconciling accounts.

use std::str::FromStr;

use agency_core::{AccountId, AccountSnapshot, Activity, Archetype, Rarity, WorkerId};
use agency_econ::{progress_to_next, Progress, ReconciliationResult};
use agency_runtime::{Agency, RuntimeConfig, ScoutOutcome, ScoutReceipt, SystemClock};
use anyhow::{anyhow, bail, Context, Result};
use persistence::{AccountStore, SqliteStore};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: agency-cli [--db URL] [--config FILE] [--json] <command>
commands:
  migrate
  open <account>
  enlist <account> <name> <income> <popularity> [rarity]
  scout <account> <pool.yaml> [seed]
  starter <account>
  toggle <account> <worker>
  tick <account>
  roster <account>
  spend <account> <amount>
  grant <account> <amount>";

#[derive(Debug, Default)]
struct Args {
    db: Option<String>,
    config: Option<String>,
    json: bool,
    version: bool,
    words: Vec<String>,
}

fn parse_args<I: IntoIterator<Item = String>>(raw: I) -> Args {
    let mut args = Args::default();
    let mut it = raw.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--db" => args.db = it.next(),
            "--config" => args.config = it.next(),
            "--json" => args.json = true,
            "--version" | "-V" => args.version = true,
            _ => args.words.push(arg),
        }
    }
    args
}

#[derive(Debug, PartialEq)]
enum Command {
    Migrate,
    Open(AccountId),
    Enlist(AccountId, Archetype),
    Scout(AccountId, String, Option<u64>),
    Starter(AccountId),
    Toggle(AccountId, WorkerId),
    Tick(AccountId),
    Roster(AccountId),
    Spend(AccountId, Decimal),
    Grant(AccountId, Decimal),
}

fn account(word: Option<&String>) -> Result<AccountId> {
    let word = word.ok_or_else(|| anyhow!("missing <account>"))?;
    Ok(AccountId(word.parse().with_context(|| format!("bad account id {word:?}"))?))
}

fn decimal(word: Option<&String>, what: &str) -> Result<Decimal> {
    let word = word.ok_or_else(|| anyhow!("missing <{what}>"))?;
    Decimal::from_str(word).with_context(|| format!("bad {what} {word:?}"))
}

fn parse_command(words: &[String]) -> Result<Command> {
    let Some((name, rest)) = words.split_first() else {
        bail!("no command given\n{USAGE}");
    };
    let cmd = match name.as_str() {
        "migrate" => Command::Migrate,
        "open" => Command::Open(account(rest.first())?),
        "enlist" => {
            let name = rest.get(1).ok_or_else(|| anyhow!("missing <name>"))?;
            Command::Enlist(
                account(rest.first())?,
                Archetype {
                    name: name.clone(),
                    rarity: rest
                        .get(4)
                        .map(|r| r.parse::<Rarity>())
                        .transpose()?
                        .unwrap_or_default(),
                    income: decimal(rest.get(2), "income")?,
                    popularity: decimal(rest.get(3), "popularity")?,
                },
            )
        }
        "scout" => {
            let pool = rest.get(1).ok_or_else(|| anyhow!("missing <pool.yaml>"))?;
            let seed = rest
                .get(2)
                .map(|s| s.parse().with_context(|| format!("bad seed {s:?}")))
                .transpose()?;
            Command::Scout(account(rest.first())?, pool.clone(), seed)
        }
        "starter" => Command::Starter(account(rest.first())?),
        "toggle" => {
            let worker = rest.get(1).ok_or_else(|| anyhow!("missing <worker>"))?;
            let worker = worker
                .parse()
                .with_context(|| format!("bad worker id {worker:?}"))?;
            Command::Toggle(account(rest.first())?, WorkerId(worker))
        }
        "tick" => Command::Tick(account(rest.first())?),
        "roster" => Command::Roster(account(rest.first())?),
        "spend" => Command::Spend(account(rest.first())?, decimal(rest.get(1), "amount")?),
        "grant" => Command::Grant(account(rest.first())?, decimal(rest.get(1), "amount")?),
        other => bail!("unknown command {other:?}\n{USAGE}"),
    };
    Ok(cmd)
}

fn ensure_save_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"));
    if let Some(path) = path.filter(|p| !p.contains(":memory:")) {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Scouting candidates, a YAML list of archetypes.
fn load_pool(path: &str) -> Result<Vec<Archetype>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {path}"))
}

fn print_scout(r: &ScoutReceipt) {
    match &r.outcome {
        ScoutOutcome::Recruited(w) => {
            println!("New worker: #{} {} [{}] | {}/s", w.id, w.name, r.rarity, w.income)
        }
        ScoutOutcome::Duplicate { name, cashback } => {
            println!("Duplicate {name} [{}] | cashback: {cashback}", r.rarity)
        }
    }
    println!("Balance: {}", r.balance.round_dp(2));
}

fn print_tick(r: &ReconciliationResult) {
    if r.is_noop() {
        println!("Nothing to reconcile");
        return;
    }
    println!(
        "Tick | elapsed: {}s | income: {} | passive: {} | fans: {}",
        r.elapsed_seconds,
        r.income_gain.round_dp(4),
        r.passive_gain.round_dp(4),
        r.total_fans.round_dp(2)
    );
    for id in &r.leveled_up {
        println!("Level up! worker #{id}");
    }
}

fn print_roster<S: AccountStore>(agency: &Agency<S>, snap: &AccountSnapshot) {
    println!(
        "Account {} | balance: {} | workers: {}",
        snap.account.id,
        snap.account.balance.round_dp(2),
        snap.workers.len()
    );
    for w in &snap.workers {
        let next = match progress_to_next(agency.policy(), w.level, &w.experience) {
            Progress::Capped => "MAX".to_string(),
            Progress::Remaining(left) => format!("{} xp to go", left.round(0)),
        };
        let state = match w.activity {
            Activity::Active => "working",
            Activity::Resting => "resting",
        };
        println!(
            "  #{} {} [{}] | Lv.{} ({}) | {}/s | stamina {}% {} | fans {}",
            w.id,
            w.name,
            w.rarity,
            w.level,
            next,
            w.income,
            w.stamina,
            state,
            w.fans.round_dp(2)
        );
    }
}

async fn run<S: AccountStore>(agency: &Agency<S>, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Migrate => println!("DB up to date"),
        Command::Open(id) => {
            if agency.open_account(id).await? {
                println!("Opened account {id}");
            } else {
                println!("Account {id} already exists");
            }
        }
        Command::Enlist(id, archetype) => {
            let w = agency.enlist(id, &archetype).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&w)?);
            } else {
                println!("Enlisted #{} {} on account {id}", w.id, w.name);
            }
        }
        Command::Scout(id, path, seed) => {
            let pool = load_pool(&path)?;
            let mut rng = match seed {
                Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                None => ChaCha8Rng::from_entropy(),
            };
            let receipt = agency.scout(id, &pool, &mut rng).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else {
                print_scout(&receipt);
            }
        }
        Command::Starter(id) => match agency.claim_starter(id).await? {
            Some(w) => println!("Welcome bonus claimed | starter: #{} {}", w.id, w.name),
            None => println!("Welcome bonus already claimed on account {id}"),
        },
        Command::Toggle(id, worker) => {
            let now = agency.toggle_activity(id, worker).await?;
            println!("Worker #{worker} is now {now:?}");
        }
        Command::Tick(id) => {
            let r = agency.reconcile(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&r)?);
            } else {
                print_tick(&r);
            }
        }
        Command::Roster(id) => {
            let snap = agency.roster(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snap)?);
            } else {
                print_roster(agency, &snap);
            }
        }
        Command::Spend(id, amount) => {
            let balance = agency.spend(id, amount).await?;
            println!("Spent {amount} | balance: {}", balance.round_dp(2));
        }
        Command::Grant(id, amount) => {
            let balance = agency.grant(id, amount).await?;
            println!("Granted {amount} | balance: {}", balance.round_dp(2));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1));
    if args.version {
        println!(
            "agency-cli {} ({} {})",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_SHA"),
            env!("BUILD_DATE")
        );
        return Ok(());
    }

    let mut cfg = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(db) = args.db.clone() {
        cfg.database_url = db;
    }
    let command = parse_command(&args.words)?;
    info!(db = %cfg.database_url, ?command, "starting CLI");

    ensure_save_dir(&cfg.database_url)?;
    let store = SqliteStore::connect(&cfg.database_url).await?;
    let agency = Agency::new(store, SystemClock, &cfg)?;
    run(&agency, command, args.json).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn flags_are_separated_from_words() {
        let args = parse_args(words("--db sqlite::memory: tick 4 --json"));
        assert_eq!(args.db.as_deref(), Some("sqlite::memory:"));
        assert!(args.json);
        assert_eq!(args.words, words("tick 4"));
    }

    #[test]
    fn parses_enlist() {
        let cmd = parse_command(&words("enlist 3 Aiko 1.5 20")).unwrap();
        assert_eq!(
            cmd,
            Command::Enlist(
                AccountId(3),
                Archetype {
                    name: "Aiko".into(),
                    rarity: Rarity::N,
                    income: Decimal::new(15, 1),
                    popularity: Decimal::new(20, 0),
                }
            )
        );
    }

    #[test]
    fn parses_scouting_commands() {
        assert_eq!(
            parse_command(&words("scout 2 pool.yaml 42")).unwrap(),
            Command::Scout(AccountId(2), "pool.yaml".into(), Some(42))
        );
        assert_eq!(
            parse_command(&words("starter 2")).unwrap(),
            Command::Starter(AccountId(2))
        );
        let Command::Enlist(_, a) = parse_command(&words("enlist 1 Rio 1 1 ssr")).unwrap() else {
            panic!("expected enlist");
        };
        assert_eq!(a.rarity, Rarity::SSR);
        assert!(parse_command(&words("scout 2")).is_err());
        assert!(parse_command(&words("scout 2 pool.yaml x")).is_err());
        assert!(parse_command(&words("enlist 1 Rio 1 1 XR")).is_err());
    }

    #[test]
    fn parses_money_commands() {
        assert_eq!(
            parse_command(&words("spend 1 12.50")).unwrap(),
            Command::Spend(AccountId(1), Decimal::new(1250, 2))
        );
        assert_eq!(
            parse_command(&words("toggle 1 9")).unwrap(),
            Command::Toggle(AccountId(1), WorkerId(9))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command(&[]).is_err());
        assert!(parse_command(&words("tick")).is_err());
        assert!(parse_command(&words("tick abc")).is_err());
        assert!(parse_command(&words("dance 1")).is_err());
        assert!(parse_command(&words("enlist 1 Aiko x 2")).is_err());
    }
}
