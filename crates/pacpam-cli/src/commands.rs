//! Command handlers for the pacpam CLI

use tracing::info;

use pacpam_core::circuit_breaker::BreakerMachine;
use pacpam_core::connection::ConnectionMachine;
use pacpam_core::presence::PresenceMachine;
use pacpam_core::session::SessionMachine;
use pacpam_core::sync_layer::SyncMachine;
use pacpam_core::Machine;

use crate::cli::{Cli, Commands, Demo, MachineName};
use crate::config::AppConfig;
use crate::demo;
use crate::error::Result;

pub struct CommandDispatcher;

impl CommandDispatcher {
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Demo { demo } => Self::handle_demo_command(demo, &config).await,
            Commands::Graph { machine } => {
                println!("{}", render_graph(machine));
                Ok(())
            }
        }
    }

    async fn handle_demo_command(demo: Demo, config: &AppConfig) -> Result<()> {
        match demo {
            Demo::Chat { messages } => {
                info!(lines = messages.len(), "starting chat demo");
                for line in demo::run_chat(config, &messages).await? {
                    println!("{line}");
                }
            }
            Demo::Counter { adds, fps } => {
                info!(actions = adds.len(), fps, "starting counter demo");
                let report = demo::run_counter(config, &adds, fps).await?;
                for (add, predicted) in adds.iter().zip(&report.predictions) {
                    println!("guest +{add:<4} predicted {predicted}");
                }
                println!("host settled at {}, guest at {}", report.host, report.guest);
            }
        }
        Ok(())
    }
}

/// Mermaid flowchart of one machine's transition table
pub fn render_graph(machine: MachineName) -> String {
    match machine {
        MachineName::Connection => ConnectionMachine::definition().to_mermaid(),
        MachineName::Sync => SyncMachine::definition().to_mermaid(),
        MachineName::Presence => PresenceMachine::definition().to_mermaid(),
        MachineName::Breaker => BreakerMachine::definition().to_mermaid(),
        MachineName::Session => SessionMachine::definition().to_mermaid(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graphs_name_their_transitions() {
        let connection = render_graph(MachineName::Connection);
        assert!(connection.starts_with("flowchart LR"));
        assert!(connection.contains("c12"));
        assert!(connection.contains("c30"));

        let sync = render_graph(MachineName::Sync);
        assert!(sync.contains("p6"));
        assert!(sync.contains("REDIAL_FAILED"));
        assert!(render_graph(MachineName::Presence).contains("g4"));
        assert!(render_graph(MachineName::Breaker).contains("cb7"));
        assert!(render_graph(MachineName::Session).contains("s1"));
    }
}
