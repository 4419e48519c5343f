use std::env;
use std::fs::metadata;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use btreedb::btree::BTreeDb;
use btreedb::btree::Direction;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use strum::EnumString;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Container location
    store: String,

    /// Create a new container (will overwrite an existing file)
    #[arg(short, long, default_value_t = false)]
    create: bool,

    /// Identifier written into the header of a created container
    #[arg(long, default_value = "btreedb")]
    identifier: String,

    /// Block size of a created container
    #[arg(long, default_value_t = 2048)]
    block_size: usize,

    /// Key width of a created container
    #[arg(long, default_value_t = 8)]
    key_size: usize,

    #[command(subcommand)]
    parameter: Option<Parameter>,
}

#[derive(Debug, EnumString, Subcommand)]
#[strum(ascii_case_insensitive)]
enum Parameter {
    /// Clear container records
    Clear,
    /// Make outstanding changes durable
    Commit,
    /// Does the container hold this key (hex)
    Contains { key: String },
    /// Display record count
    Count,
    /// Delete this key (hex)
    Delete { key: String },
    /// List records
    Entries {
        /// Direction (Descending or Ascending)
        direction: Option<Direction>,
    },
    /// Show the smallest record
    First,
    /// Get the value stored under this key (hex)
    Get { key: String },
    /// Interactive help
    Help,
    /// Container summary
    Info,
    /// Insert a key (hex) and value
    Insert { key: String, value: String },
    /// List keys
    Keys {
        /// Direction (Descending or Ascending)
        direction: Option<Direction>,
    },
    /// Show the largest record
    Last,
    /// Discard outstanding changes
    Rollback,
    /// Leaf space utilization
    Utilization,
    /// List values
    Values {
        /// Direction (Descending or Ascending)
        direction: Option<Direction>,
    },
    /// Check container invariants
    Verify,
}

fn parse_key(word: &str, key_size: usize) -> Option<Vec<u8>> {
    match hex::decode(word) {
        Ok(key) if key.len() == key_size => Some(key),
        Ok(key) => {
            println!("key is {} bytes, container uses {key_size}", key.len());
            None
        }
        Err(e) => {
            println!("keys are entered in hex: {e}");
            None
        }
    }
}

fn get_history_file() -> Option<PathBuf> {
    dirs::preference_dir()
        .and_then(|mut base| {
            base.push("btreedb");
            // Note: Not create_dir_all(), because we don't want to create
            // preference dirs if they don't exist.
            if metadata(base.clone()).ok().is_none() {
                std::fs::create_dir(base.clone()).ok()?
            }
            Some(base)
        })
        .map(|mut base| {
            base.push("history.txt");
            base
        })
}

fn parse_direction(words: &[&str], usage: &str) -> Option<Option<Direction>> {
    match words.len() {
        1 => Some(None),
        2 => match Direction::from_str(words[1]) {
            Ok(direction) => Some(Some(direction)),
            Err(_) => {
                println!("usage: {usage}");
                None
            }
        },
        _ => {
            println!("usage: {usage}");
            None
        }
    }
}

fn parse_line(line: &str) -> Option<Parameter> {
    let words = line.split_whitespace().collect::<Vec<&str>>();
    let first = words.first()?;
    let parameter = match Parameter::from_str(first) {
        Ok(p) => p,
        Err(e) => {
            println!("error: {e}");
            return None;
        }
    };
    // EnumString doesn't deal with variant parameters, so fill them in by
    // hand.
    match parameter {
        Parameter::Contains { .. } => {
            if words.len() != 2 {
                println!("usage: contains <key>");
                return None;
            }
            Some(Parameter::Contains {
                key: words[1].to_string(),
            })
        }
        Parameter::Delete { .. } => {
            if words.len() != 2 {
                println!("usage: delete <key>");
                return None;
            }
            Some(Parameter::Delete {
                key: words[1].to_string(),
            })
        }
        Parameter::Get { .. } => {
            if words.len() != 2 {
                println!("usage: get <key>");
                return None;
            }
            Some(Parameter::Get {
                key: words[1].to_string(),
            })
        }
        Parameter::Insert { .. } => {
            if words.len() != 3 {
                println!("usage: insert <key> <value>");
                return None;
            }
            Some(Parameter::Insert {
                key: words[1].to_string(),
                value: words[2].to_string(),
            })
        }
        Parameter::Entries { .. } => parse_direction(&words, "entries [<direction>]")
            .map(|direction| Parameter::Entries { direction }),
        Parameter::Keys { .. } => {
            parse_direction(&words, "keys [<direction>]").map(|direction| Parameter::Keys {
                direction,
            })
        }
        Parameter::Values { .. } => parse_direction(&words, "values [<direction>]")
            .map(|direction| Parameter::Values { direction }),
        p => Some(p),
    }
}

async fn interactive(db: &BTreeDb) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.load_history(&file_location) {
            println!("error loading history: {e}");
        }
    }
    println!("terminate with ctrl-c or ctrl-d");
    loop {
        let readline = rl.readline("btreedb: ");
        match readline {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                if let Some(parameter) = parse_line(&line) {
                    process_parameter(db, &parameter).await;
                }
                rl.add_history_entry(line.as_str())?;
            }
            Err(ReadlineError::Interrupted) => {
                println!("terminating...");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("terminating...");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.save_history(&file_location) {
            println!("error saving history: {e}");
        }
    }
    Ok(())
}

async fn process_parameter(db: &BTreeDb, parameter: &Parameter) {
    let key_size = db.key_size().await;
    match parameter {
        Parameter::Clear => match db.clear().await {
            Ok(_) => println!("cleared"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Commit => match db.commit().await {
            Ok(_) => println!("committed"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Contains { key } => {
            let Some(key) = parse_key(key, key_size) else {
                return;
            };
            match db.contains(&key).await {
                Ok(found) => println!("{found}"),
                Err(e) => println!("error: {e}"),
            }
        }
        Parameter::Count => match db.count().await {
            Ok(count) => println!("count: {count}"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Delete { key } => {
            let Some(key) = parse_key(key, key_size) else {
                return;
            };
            match db.delete(&key).await {
                Ok(Some(value)) => {
                    println!("deleted: {}: {}", hex::encode(&key), String::from_utf8_lossy(&value))
                }
                Ok(None) => println!("not found"),
                Err(e) => println!("delete failed: {e}"),
            }
        }
        Parameter::Entries { direction } => {
            db.print_entries((*direction).unwrap_or(Direction::Ascending))
                .await
        }
        Parameter::First => match db.first().await {
            Ok((key, value)) => {
                println!("{}: {}", hex::encode(key), String::from_utf8_lossy(&value))
            }
            Err(e) => println!("error: {e}"),
        },
        Parameter::Get { key } => {
            let Some(key) = parse_key(key, key_size) else {
                return;
            };
            match db.get(&key).await {
                Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
                Err(e) => println!("error: {e}"),
            }
        }
        Parameter::Help => {
            let help = Cli::command().render_help().to_string();

            let mut print_it = false;

            for line in help.lines() {
                if line.starts_with("Arguments:") {
                    print_it = false;
                }
                if print_it && !line.is_empty() {
                    println!("{}", line);
                }
                if line.starts_with("Commands:") {
                    print_it = true;
                }
            }
        }
        Parameter::Info => {
            if let Err(e) = db.info().await {
                println!("error: {e}");
            }
        }
        Parameter::Insert { key, value } => {
            let Some(key) = parse_key(key, key_size) else {
                return;
            };
            match db.insert(&key, value.as_bytes()).await {
                Ok(Some(old)) => println!("old value: {}", String::from_utf8_lossy(&old)),
                Ok(None) => println!("inserted: {}: {value}", hex::encode(&key)),
                Err(e) => println!("insert failed: {e}"),
            }
        }
        Parameter::Keys { direction } => {
            db.print_keys((*direction).unwrap_or(Direction::Ascending))
                .await
        }
        Parameter::Last => match db.last().await {
            Ok((key, value)) => {
                println!("{}: {}", hex::encode(key), String::from_utf8_lossy(&value))
            }
            Err(e) => println!("error: {e}"),
        },
        Parameter::Rollback => match db.rollback().await {
            Ok(_) => println!("rolled back"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Utilization => match db.utilization().await {
            Ok(utilization) => println!("Utilization: {:.1}%", 100.0 * utilization),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Values { direction } => {
            db.print_values((*direction).unwrap_or(Direction::Ascending))
                .await
        }
        Parameter::Verify => match db.verify().await {
            Ok(_) => println!("Ok"),
            Err(e) => println!("Verification failed: {e}"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match env::var("TMPDIR") {
        Ok(d) => d,
        Err(_e) => ".".to_string(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "btreedb.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    let db = if cli.create {
        BTreeDb::try_create(&cli.store, &cli.identifier, cli.block_size, cli.key_size).await?
    } else {
        BTreeDb::try_open(&cli.store).await?
    };

    match cli.parameter {
        Some(parameter) => process_parameter(&db, &parameter).await,
        None => interactive(&db).await?,
    }
    db.close().await
}
