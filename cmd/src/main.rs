use tracing::Level;

use abi::config::Config;
use db::DbRepo;
use ws::ws_server::WsServer;

#[tokio::main]
async fn main() {
    // init tracing
    tracing_subscriber::FmtSubscriber::builder()
        .with_line_number(true)
        .with_max_level(Level::DEBUG)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./abi/fixtures/hub.yml".to_string());
    let config = Config::load(config_path).unwrap();

    let db = DbRepo::new(&config).await.unwrap();
    WsServer::start(config, db).await.unwrap();
}
