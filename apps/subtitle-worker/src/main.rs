use subtitle_worker::run;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    run().await
}
