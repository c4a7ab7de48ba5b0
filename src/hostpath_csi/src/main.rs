use hostpath_csi::{run_node_agent, NodeAgentRunOptions, DEFAULT_NODE_AGENT_CONFIG_PATH};
use log::error;
use std::env;
use std::path::PathBuf;

fn usage() -> String {
    format!(
        "usage: hostpath_node [--config <path>]\n\
         defaults:\n\
         --config {}",
        DEFAULT_NODE_AGENT_CONFIG_PATH
    )
}

fn parse_args() -> Result<NodeAgentRunOptions, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = PathBuf::from(DEFAULT_NODE_AGENT_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(NodeAgentRunOptions { config_path })
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let options = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_node_agent(options).await {
        error!("run hostpath_node failed: {}", err);
        std::process::exit(1);
    }
}
