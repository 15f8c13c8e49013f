use clap::Parser;

use xgate_common::AppConfigPatch;

#[derive(Debug, Parser)]
#[command(name = "xgate", about = "OpenAI-compatible gateway for the grok.com upstream")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "data/config.json")]
    pub config: String,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for the token catalog and media cache.
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Outbound proxy URL for upstream traffic.
    #[arg(long)]
    pub proxy: Option<String>,
}

impl Cli {
    pub fn as_patch(&self) -> AppConfigPatch {
        AppConfigPatch {
            host: self.host.clone(),
            port: self.port,
            data_dir: self.data_dir.clone(),
            proxy: self.proxy.clone(),
            ..Default::default()
        }
    }
}
