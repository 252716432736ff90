#[tokio::main]
async fn main() {
    taskbox::run().await
}
