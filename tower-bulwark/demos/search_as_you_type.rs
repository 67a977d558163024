//! A search box that fires a request on every keystroke.
//!
//! Every keystroke shares one cancellation key, so each search supersedes the
//! one still in flight and only the last reaches the screen.
//! Run with `RUST_LOG=debug` to watch the stack at work.

use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::service_fn;
use tower_bulwark::ApiRequest;
use tower_bulwark::ApiResponse;
use tower_bulwark::Client;
use tower_bulwark::ClientConfig;
use tracing_subscriber::EnvFilter;

async fn search_api(req: ApiRequest) -> Result<ApiResponse, BoxError> {
    sleep(Duration::from_millis(120)).await;
    let query = req
        .params
        .as_ref()
        .and_then(|params| params.get("q"))
        .and_then(|q| q.as_str())
        .unwrap_or_default()
        .to_string();
    let hits: Vec<String> = ["paris", "parma", "pamplona", "porto"]
        .iter()
        .filter(|city| city.starts_with(&query))
        .map(|city| city.to_string())
        .collect();
    Ok(ApiResponse::json(http::StatusCode::OK, &json!({ "q": query, "hits": hits })))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = Client::new(ClientConfig::default(), service_fn(search_api))?;
    let started = Instant::now();
    let mut searches = JoinSet::new();

    for typed in ["p", "pa", "par", "pari", "paris"] {
        let client = client.clone();
        searches.spawn(async move {
            let req = ApiRequest::get("/search")
                .with_params(json!({ "q": typed }))
                .with_cancel_key("search-box");
            (typed, client.send(req).await)
        });
        sleep(Duration::from_millis(40)).await;
    }

    while let Some(search) = searches.join_next().await {
        match search? {
            (typed, Ok(response)) => {
                println!("{typed:>6}: {}", String::from_utf8_lossy(&response.body))
            }
            (typed, Err(err)) if err.is_superseded() => {
                println!("{typed:>6}: superseded after {:?}", err.elapsed)
            }
            (typed, Err(err)) => println!("{typed:>6}: failed: {err}"),
        }
    }
    println!("done in {:.2?}", started.elapsed());

    Ok(())
}
