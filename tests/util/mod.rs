use std::sync::Arc;
use uuid::Uuid;
use verlease::store::dynamodb::{DynamoDbControl, DynamoDbStore};
use verlease::Session;

/// Where the suite expects a local dynamodb to listen. Override with
/// `VERLEASE_TEST_ENDPOINT` when it runs elsewhere.
const DEFAULT_ENDPOINT: &str = "http://localhost:8000";

/// Client pointed at the local dynamodb. The region is arbitrary; the
/// local emulator accepts any.
pub async fn test_client() -> aws_sdk_dynamodb::Client {
    let endpoint = std::env::var("VERLEASE_TEST_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_ENDPOINT.to_owned());
    let conf = aws_config::from_env().region("us-east-1").load().await;
    let conf = aws_sdk_dynamodb::config::Builder::from(&conf)
        .endpoint_resolver(aws_sdk_dynamodb::Endpoint::immutable(
            endpoint.parse().expect("invalid test endpoint"),
        ))
        .build();
    aws_sdk_dynamodb::Client::from_conf(conf)
}

/// A session over `table_name`, creating the lock table if needed and
/// checking its schema.
pub async fn test_session(table_name: &str, host: &str) -> Session {
    let client = test_client().await;
    DynamoDbControl::new(client.clone(), table_name)
        .create()
        .await
        .expect("dynamodb create failed: is a local dynamodb running?");
    let store = DynamoDbStore::connect(client, table_name)
        .await
        .expect("schema check failed");
    Session::builder()
        .host_identifier(host)
        .build(Arc::new(store))
}

/// A lock name no other test run can collide with.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}:{}", Uuid::new_v4())
}
