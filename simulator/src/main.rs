mod device;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    device::run().await
}
