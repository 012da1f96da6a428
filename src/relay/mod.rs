pub mod app;
pub mod logging;
pub mod net;
pub mod tls;
pub mod tunnel;

pub async fn run(port: u16) -> anyhow::Result<()> {
    app::run(port).await
}
