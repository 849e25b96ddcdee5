//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path (TOML)
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run two endpoints in this process over the in-memory transport
    Demo {
        #[command(subcommand)]
        demo: Demo,
    },
    /// Print a state machine as a Mermaid flowchart
    Graph {
        #[arg(value_enum)]
        machine: MachineName,
    },
}

#[derive(Subcommand)]
pub enum Demo {
    /// Independent chat session; the guest echoes every line
    Chat {
        /// Lines the host sends
        #[arg(default_values_t = vec!["hello".to_string(), "how are you?".to_string()])]
        messages: Vec<String>,
    },
    /// Centralized counter with client-side prediction on the guest
    Counter {
        /// Increments the guest sends
        #[arg(default_values_t = vec![1, 2, 3])]
        adds: Vec<i64>,
        /// Host state pushes per second (0 = after each action only)
        #[arg(long, default_value_t = 0)]
        fps: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MachineName {
    Connection,
    Sync,
    Presence,
    Breaker,
    Session,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo_and_graph() {
        let cli = Cli::parse_from(["pacpam", "--config", "peer.toml", "demo", "counter", "4", "5", "--fps", "10"]);
        assert_eq!(cli.config.as_deref(), Some("peer.toml"));
        match cli.command {
            Commands::Demo {
                demo: Demo::Counter { adds, fps },
            } => {
                assert_eq!(adds, vec![4, 5]);
                assert_eq!(fps, 10);
            }
            _ => panic!("expected the counter demo"),
        }

        let cli = Cli::parse_from(["pacpam", "graph", "connection"]);
        assert!(matches!(
            cli.command,
            Commands::Graph {
                machine: MachineName::Connection
            }
        ));
        assert!(Cli::try_parse_from(["pacpam", "graph", "toaster"]).is_err());
    }

    #[test]
    fn test_chat_defaults() {
        let cli = Cli::parse_from(["pacpam", "-v", "demo", "chat"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Demo {
                demo: Demo::Chat { messages },
            } => assert_eq!(messages.len(), 2),
            _ => panic!("expected the chat demo"),
        }
    }
}
