mod serve;
mod subroutine_cmd;

use anyhow::Result;
use console::style;

use crate::core::config::{self, EngineConfig};
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Core")
        .command("serve", "Start the engine and HTTP API, resuming active subroutines")
        .command("run", "Run one cycle of a subroutine in the foreground")
        .command("list", "List an agent's subroutines")
        .print();

    GuideSection::new("Flags")
        .command("--agent, -a <name>", "Agent that owns the conversation")
        .command("--chat, -c <name>", "Conversation name")
        .command("--api-host <host>", "Override [server] host for serve")
        .command("--api-port <port>", "Override [server] port for serve")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("subroutines").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TargetArgs {
    pub agent: String,
    pub chat: String,
}

pub(crate) fn parse_target_args(args: &[String], start: usize) -> TargetArgs {
    let mut agent = String::new();
    let mut chat = String::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--agent" | "-a" => {
                if i + 1 < args.len() {
                    agent = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--chat" | "-c" => {
                if i + 1 < args.len() {
                    chat = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    TargetArgs { agent, chat }
}

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let default_port = api_port;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(default_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match cmd {
        "serve" => {
            let data_dir = config::data_dir();
            let mut engine_config = EngineConfig::load(&data_dir).await?;
            let (host, port) = parse_api_server_flags(
                &args,
                2,
                engine_config.server.host.clone(),
                engine_config.server.port,
            );
            engine_config.server.host = host;
            engine_config.server.port = port;
            serve::run_server(data_dir, engine_config).await
        }
        "run" => {
            let target = parse_target_args(&args, 2);
            if target.agent.is_empty() || target.chat.is_empty() {
                print_error("Error: --agent and --chat are required for run.");
                print_help();
                return Ok(());
            }
            let data_dir = config::data_dir();
            let engine_config = EngineConfig::load(&data_dir).await?;
            subroutine_cmd::run_once(&data_dir, engine_config, &target).await
        }
        "list" => {
            let target = parse_target_args(&args, 2);
            if target.agent.is_empty() {
                print_error("Error: --agent is required for list.");
                print_help();
                return Ok(());
            }
            subroutine_cmd::list(&config::data_dir(), &target.agent).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}
