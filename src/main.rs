// CorvusDB server binary

use corvus_db::config::{self, ServerConfig};
use corvus_db::server::{CorvusServer, ServerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let db_name = args.next().unwrap_or_else(|| "demodb".to_string());
    let listen_addr = args.next().unwrap_or_else(|| "127.0.0.1:41523".to_string());
    let config_path = args.next().map(PathBuf::from);
    let master_addr = args.next();

    let config = match config_path {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "cannot load configuration");
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let db_path = match config::resolve_database_dir(&db_name) {
        Ok(dir) => dir.display().to_string(),
        Err(_) => {
            info!(db = %db_name, "database not registered; running with a local directory");
            format!("./{}", db_name)
        }
    };

    let options = ServerOptions {
        db_name: db_name.clone(),
        server_name: db_name,
        listen_addr,
        master_addr,
        ..Default::default()
    };
    let server = Arc::new(CorvusServer::new(options, config, &db_path));

    match server.register_with_master() {
        Ok(Some(reply)) => info!(?reply, "registered with master"),
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "master registration failed");
            std::process::exit(1);
        }
    }

    if let Err(e) = server.run() {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
