use std::sync::Arc;

use agentx_master::{
    configuration::{Configuration, Parser},
    master::{Collaborators, Master},
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    log::info!("Configuration valid. Starting up...");

    let collaborators = Collaborators {
        address_filter: Arc::new(conf.address_filter()),
        ..Collaborators::default()
    };
    let master = Arc::new(Master::with_collaborators(conf.master_config(), collaborators));

    if let Err(e) = master.clone().run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    master.status().print(conf.output_format);
}
