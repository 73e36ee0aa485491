#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chatsync::run().await
}
