mod app;
mod error;
mod feed;
mod media;
mod notify;
mod prompting;
mod responder;
mod store;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
