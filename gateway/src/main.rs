mod api;
mod app;
mod automation;
mod device;
mod dispatcher;
mod poller;
mod proxy;
mod schedules;
mod settings;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
