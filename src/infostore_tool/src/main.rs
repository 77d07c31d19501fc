mod tool;

use infostore::DEFAULT_INFOSTORE_CONFIG_PATH;
use infostore_lib::CURRENT_VERSION;
use log::error;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::tool::{run_tool, ToolCommand, ToolOptions};

fn usage() -> String {
    format!(
        "usage: infostore_tool [--config <path>] [--root <dir>] [--context <id>] [--user <id>] \
         [--folder <id>]... <command> [args]\n\
         commands:\n\
         put <folder> <file> [--name <filename>] [--update <id>]\n\
         get <id> [--version <n>] [--out <path>]\n\
         stat <id>\n\
         ls <folder>\n\
         versions <id>\n\
         rm <folder> <id>...\n\
         prune <id> <version>...\n\
         mv <from> <to> <id>...\n\
         lock <id> [--timeout <secs>]\n\
         unlock <id>\n\
         delta <folder> <since>\n\
         defaults:\n\
         --config {}",
        DEFAULT_INFOSTORE_CONFIG_PATH
    )
}

fn number<T: std::str::FromStr>(value: Option<&String>, what: &str) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("missing {}", what))?;
    value
        .parse::<T>()
        .map_err(|_| format!("invalid {}: {}", what, value))
}

fn numbers<T: std::str::FromStr>(values: &[String], what: &str) -> Result<Vec<T>, String> {
    if values.is_empty() {
        return Err(format!("missing {}", what));
    }
    values.iter().map(|v| number(Some(v), what)).collect()
}

fn parse_command(args: &[String]) -> Result<ToolCommand, String> {
    let name = args.first().ok_or_else(usage)?;
    let rest = &args[1..];
    let mut positional = Vec::new();
    let mut flags: Vec<(String, String)> = Vec::new();
    let mut i = 0usize;
    while i < rest.len() {
        if let Some(flag) = rest[i].strip_prefix("--") {
            i += 1;
            let value = rest
                .get(i)
                .ok_or_else(|| format!("missing value for --{}", flag))?;
            flags.push((flag.to_string(), value.clone()));
        } else {
            positional.push(rest[i].clone());
        }
        i += 1;
    }
    let flag = |key: &str| {
        flags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    if let Some((unknown, _)) = flags.iter().find(|(k, _)| {
        !matches!(
            k.as_str(),
            "name" | "update" | "version" | "out" | "timeout"
        )
    }) {
        return Err(format!("unknown argument: --{}\n{}", unknown, usage()));
    }

    let command = match name.as_str() {
        "put" => ToolCommand::Put {
            folder_id: number(positional.first(), "folder")?,
            source: PathBuf::from(positional.get(1).ok_or_else(|| "missing file".to_string())?),
            filename: flag("name"),
            update: flag("update")
                .map(|v| number(Some(&v), "document id"))
                .transpose()?,
        },
        "get" => ToolCommand::Get {
            id: number(positional.first(), "document id")?,
            version: flag("version")
                .map(|v| number(Some(&v), "version"))
                .transpose()?
                .unwrap_or(CURRENT_VERSION),
            out: flag("out").map(PathBuf::from),
        },
        "stat" => ToolCommand::Stat {
            id: number(positional.first(), "document id")?,
        },
        "ls" => ToolCommand::List {
            folder_id: number(positional.first(), "folder")?,
        },
        "versions" => ToolCommand::Versions {
            id: number(positional.first(), "document id")?,
        },
        "rm" => ToolCommand::Remove {
            folder_id: number(positional.first(), "folder")?,
            ids: numbers(positional.get(1..).unwrap_or_default(), "document id")?,
        },
        "prune" => ToolCommand::Prune {
            id: number(positional.first(), "document id")?,
            versions: numbers(positional.get(1..).unwrap_or_default(), "version")?,
        },
        "mv" => ToolCommand::Move {
            from: number(positional.first(), "source folder")?,
            to: number(positional.get(1), "target folder")?,
            ids: numbers(positional.get(2..).unwrap_or_default(), "document id")?,
        },
        "lock" => ToolCommand::Lock {
            id: number(positional.first(), "document id")?,
            timeout: flag("timeout")
                .map(|v| number::<u64>(Some(&v), "timeout"))
                .transpose()?
                .map(Duration::from_secs),
        },
        "unlock" => ToolCommand::Unlock {
            id: number(positional.first(), "document id")?,
        },
        "delta" => ToolCommand::Delta {
            folder_id: number(positional.first(), "folder")?,
            since: number(positional.get(1), "since")?,
        },
        other => return Err(format!("unknown command: {}\n{}", other, usage())),
    };
    Ok(command)
}

fn parse_args() -> Result<ToolOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mut config_path = PathBuf::from(DEFAULT_INFOSTORE_CONFIG_PATH);
    let mut root = None;
    let mut context_id = 1;
    let mut user_id = 1;
    let mut folders = Vec::new();

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            "--root" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --root".to_string())?;
                root = Some(PathBuf::from(value));
            }
            "--context" => {
                i += 1;
                context_id = number(args.get(i), "context id")?;
            }
            "--user" => {
                i += 1;
                user_id = number(args.get(i), "user id")?;
            }
            "--folder" => {
                i += 1;
                folders.push(number(args.get(i), "folder")?);
            }
            _ => break,
        }
        i += 1;
    }

    let command = parse_command(&args[i..])?;
    let mut options = ToolOptions::new(command);
    options.config_path = config_path;
    options.root = root;
    options.context_id = context_id;
    options.user_id = user_id;
    options.folders = folders;
    Ok(options)
}

fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_tool(options) {
        error!("infostore_tool failed: [{}] {}", err.code(), err);
        std::process::exit(1);
    }
}
