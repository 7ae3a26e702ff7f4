use anyhow::Context;
use tracing::Level;

use ferry::Server;
use ferry::config::Config;
use ferry::http::request::IncomingMessage;
use ferry::http::response::ServerResponse;

fn handle(req: &IncomingMessage, res: &mut ServerResponse) -> anyhow::Result<()> {
    let body = format!(
        "{} {} HTTP/{}\n{} body bytes\n",
        req.method(),
        req.target(),
        req.http_version(),
        req.body().len()
    );
    res.set_header("Content-Type", "text/plain; charset=utf-8")?;
    res.end_with(body);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    let level: Level = cfg
        .log_level
        .parse()
        .with_context(|| format!("invalid log_level {:?}", cfg.log_level))?;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    let server = Server::with_options(cfg.server_options(), handle);
    server.listen(&cfg.listen_addr).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    server.close().await;

    Ok(())
}
