mod client;
mod daemon;

use anyhow::{Context, Result, bail};
use console::style;

use crate::core::config::KeeperConfig;
use crate::core::terminal::print_error;
use crate::platform::{NativePlatform, Platform};
use client::ApiClient;

const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_REPOSITORY_LIMIT: usize = 30;

fn print_help() {
    println!(
        "\n {} keeps one remote session alive through GitHub Actions runs.\n",
        style("vmkeeper").green().bold()
    );

    let section = |title: &str, rows: &[(&str, &str)]| {
        println!(" {}", style(title).bold().underlined());
        for (cmd, desc) in rows {
            println!("   {:<28} {}", style(cmd).cyan(), desc);
        }
        println!();
    };

    section(
        "Daemon",
        &[("run", "Run the reconciler and HTTP API in the foreground")],
    );
    section(
        "Workflow",
        &[
            ("status", "Show the keeper's state and current session"),
            ("history [--limit N]", "Show recent runs and sessions"),
            ("start", "Arm automatic dispatch and start a run"),
            ("stop", "Cancel the current run and disarm"),
            ("restart [reason]", "Cancel and dispatch a fresh run"),
            ("reset", "Zero the restart counters"),
        ],
    );
    section(
        "Configuration",
        &[
            ("account add <token>", "Validate and store a GitHub token"),
            ("account list", "List stored accounts"),
            ("account use <login>", "Switch the active account"),
            ("account remove <login>", "Forget an account"),
            ("repo <owner/name>", "Select the repository to dispatch in"),
            ("repo list [--limit N]", "List the active account's repositories"),
            ("repo create [name]", "Create a repository with the worker workflow"),
            ("repo push-workflow [file]", "Push the worker workflow to the active repo"),
        ],
    );
    section(
        "Options",
        &[
            ("--api-host <host>", "API host (default from config.toml)"),
            ("--api-port <port>", "API port (default from config.toml)"),
            ("--token <token>", "API bearer token"),
        ],
    );

    println!(
        " {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("vmkeeper").green()
    );
}

/// Options shared by every subcommand; unset values fall back to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CliFlags {
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub token: Option<String>,
    pub limit: Option<usize>,
    /// Arguments that are not flags, in order.
    pub positional: Vec<String>,
}

pub(crate) fn parse_flags(args: &[String], start: usize) -> Result<CliFlags> {
    let mut flags = CliFlags::default();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--api-host" | "--host", Some(v)) => {
                flags.api_host = Some(v.clone());
                i += 2;
            }
            ("--api-port" | "--port", Some(v)) => {
                flags.api_port = Some(
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("invalid port: {}", v))?,
                );
                i += 2;
            }
            ("--token", Some(v)) => {
                flags.token = Some(v.clone());
                i += 2;
            }
            ("--limit" | "-n", Some(v)) => {
                flags.limit = Some(
                    v.parse()
                        .map_err(|_| anyhow::anyhow!("invalid limit: {}", v))?,
                );
                i += 2;
            }
            (flag, None) if flag.starts_with("--") => bail!("missing value for {}", flag),
            (arg, _) => {
                flags.positional.push(arg.to_string());
                i += 1;
            }
        }
    }
    Ok(flags)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let flags = parse_flags(&args, 2)?;
    let data_dir = NativePlatform::data_dir();

    if cmd == "run" {
        return daemon::run_daemon(&data_dir, &flags).await;
    }

    let mut config = KeeperConfig::load(&data_dir).await?;
    daemon::apply_overrides(&mut config, &flags);
    let api = ApiClient::new(&config.api);
    let first = flags.positional.first().map(String::as_str);

    match cmd {
        "status" => client::show_status(&api, &data_dir).await,
        "history" => {
            client::show_history(&api, flags.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)).await
        }
        "start" => client::start(&api).await,
        "stop" => client::stop(&api).await,
        "restart" => {
            let reason = Some(flags.positional.join(" ")).filter(|r| !r.trim().is_empty());
            client::restart(&api, reason).await
        }
        "reset" => client::reset_counters(&api).await,
        "repo" | "repos" => {
            let arg = flags.positional.get(1).map(String::as_str);
            match (first, arg) {
                (Some("list") | None, _) => {
                    client::list_repositories(&api, flags.limit.unwrap_or(DEFAULT_REPOSITORY_LIMIT))
                        .await
                }
                (Some("create"), name) => client::create_repository(&api, name).await,
                (Some("push-workflow"), file) => {
                    let content = match file {
                        Some(path) => Some(
                            tokio::fs::read_to_string(path)
                                .await
                                .with_context(|| format!("failed to read workflow file {}", path))?,
                        ),
                        None => None,
                    };
                    client::push_workflow(&api, content).await
                }
                (Some(full_name), None) => client::select_repository(&api, full_name).await,
                _ => bail!(
                    "usage: vmkeeper repo <owner/name> | list | create [name] | push-workflow [file]"
                ),
            }
        }
        "account" | "accounts" => {
            let arg = flags.positional.get(1).map(String::as_str);
            match (first, arg) {
                (Some("add"), Some(token)) => client::add_account(&api, token).await,
                (Some("list") | None, _) => client::list_accounts(&api).await,
                (Some("use"), Some(id)) => client::switch_account(&api, id).await,
                (Some("remove"), Some(id)) => client::remove_account(&api, id).await,
                _ => bail!("usage: vmkeeper account add <token> | list | use <login> | remove <login>"),
            }
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            bail!("unknown command '{}'", cmd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_flags_reads_host_port_and_token() {
        let argv = args(&[
            "vmkeeper",
            "run",
            "--api-host",
            "0.0.0.0",
            "--api-port",
            "19000",
            "--token",
            "s3cret",
        ]);
        let flags = parse_flags(&argv, 2).unwrap();
        assert_eq!(flags.api_host.as_deref(), Some("0.0.0.0"));
        assert_eq!(flags.api_port, Some(19000));
        assert_eq!(flags.token.as_deref(), Some("s3cret"));
        assert!(flags.positional.is_empty());
    }

    #[test]
    fn parse_flags_keeps_positionals_in_order() {
        let argv = args(&["vmkeeper", "account", "use", "octocat", "--limit", "5"]);
        let flags = parse_flags(&argv, 2).unwrap();
        assert_eq!(flags.positional, vec!["use", "octocat"]);
        assert_eq!(flags.limit, Some(5));
    }

    #[test]
    fn parse_flags_rejects_bad_port() {
        let argv = args(&["vmkeeper", "status", "--api-port", "seventeen"]);
        let err = parse_flags(&argv, 2).unwrap_err();
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn parse_flags_rejects_dangling_flag() {
        let argv = args(&["vmkeeper", "history", "--limit"]);
        assert!(parse_flags(&argv, 2).is_err());
    }

    #[test]
    fn repo_subcommand_and_argument_are_positionals() {
        let argv = args(&["vmkeeper", "repo", "push-workflow", "ci/worker.yml"]);
        let flags = parse_flags(&argv, 2).unwrap();
        assert_eq!(flags.positional, vec!["push-workflow", "ci/worker.yml"]);
    }

    #[test]
    fn restart_reason_is_joined_from_positionals() {
        let argv = args(&["vmkeeper", "restart", "new", "image"]);
        let flags = parse_flags(&argv, 2).unwrap();
        assert_eq!(flags.positional.join(" "), "new image");
    }
}
