use opensearch_operator::client::KubeClient;
use opensearch_operator::cluster::OperatorContext;
use opensearch_operator::config::{self, ClientConfig};
use opensearch_operator::metrics::Metrics;
use opensearch_operator::template::TemplateSet;
use opensearch_operator::{operator, server};

use std::path::Path;
use std::sync::Arc;

const OPERATOR_NAME: &str = "opensearch-operator";
const SERVER_PORT: u16 = 8080;

#[tokio::main]
async fn main() {
    init_logger();

    let client_config = match ClientConfig::load(OPERATOR_NAME) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    };

    let templates_dir =
        std::env::var("TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_owned());
    let templates = match TemplateSet::load(Path::new(&templates_dir)) {
        Ok(templates) => templates,
        Err(err) => {
            log::error!("Failed to load templates from '{}': {}", templates_dir, err);
            std::process::exit(1);
        }
    };

    let operator_namespace = match config::operator_namespace() {
        Ok(namespace) => namespace,
        Err(err) => {
            log::error!("Unable to determine the operator namespace: {}", err);
            std::process::exit(1);
        }
    };

    let metrics = Metrics::new();
    let client = match KubeClient::new(client_config, metrics.client_metrics()) {
        Ok(client) => client,
        Err(err) => {
            log::error!("Failed to construct the Kubernetes client: {}", err);
            std::process::exit(1);
        }
    };

    let context = Arc::new(OperatorContext::new(
        client,
        templates,
        metrics,
        operator_namespace,
    ));

    tokio::spawn(server::start(SERVER_PORT, Arc::clone(&context)));

    if let Err(err) = operator::run(context).await {
        log::error!("Operator terminated with error: {}", err);
        std::process::exit(1);
    }
}

/// `LOG_LEVEL` is one of ERROR|WARN|INFO|DEBUG, default DEBUG.
fn init_logger() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "DEBUG".to_owned());
    let filter = match level.to_uppercase().as_str() {
        "ERROR" => log::LevelFilter::Error,
        "WARN" => log::LevelFilter::Warn,
        "INFO" => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(filter).init();
}
