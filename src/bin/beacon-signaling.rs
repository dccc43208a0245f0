use beacon_signaling::server::{Config, SignalingService};

#[tokio::main]
async fn main() {
    beacon_log::init();
    match Config::new().and_then(SignalingService::new) {
        Ok(service) => {
            if let Err(e) = service.run().await {
                eprintln!("{e}");
            }
        }
        Err(e) => eprintln!("{e}"),
    }
}
