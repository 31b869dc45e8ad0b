use bedrock_wire::codec::{ExtensionRegistry, Value};
use bedrock_wire::config::{FrameConfig, IV_LEN, KEY_LEN};
use bedrock_wire::core::frame::{FramePipeline, SecretMaterial};
use bedrock_wire::protocol::Protocol;
use std::sync::Arc;

const FIXTURE: &str = include_str!("fixtures/protocol.json");

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_encode_decode_shared_protocol() {
    use tokio::task::JoinSet;

    let iterations = 5_000usize;
    let payload_sizes = [0usize, 64, 512, 4096, 65536];
    let protocol = Arc::new(Protocol::from_json(FIXTURE, &ExtensionRegistry::default()).unwrap());

    let mut tasks = JoinSet::new();
    for &size in &payload_sizes {
        let protocol = protocol.clone();
        tasks.spawn(async move {
            for i in 0..iterations {
                let params = Value::map([
                    ("channel", Value::from(format!("task-{size}"))),
                    ("data", Value::Bytes(vec![((i + size) & 0xFF) as u8; size])),
                ]);
                let bytes = protocol.encode("script_message", &params).unwrap();
                let decoded = protocol.decode(&bytes).unwrap();
                assert_eq!(decoded.params, params);
            }
        });
    }

    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_pipelines_per_connection() {
    use tokio::task::JoinSet;

    let mut tasks = JoinSet::new();
    for conn in 0..16u8 {
        tasks.spawn(async move {
            let secret = SecretMaterial::new([conn; KEY_LEN], [conn ^ 0xff; IV_LEN]);
            let config = FrameConfig::default();
            let mut tx = FramePipeline::new(secret.clone(), &config).unwrap();
            let mut rx = FramePipeline::new(secret, &config).unwrap();
            for i in 0..500u32 {
                let frame = tx.encrypt(&i.to_le_bytes()).unwrap();
                assert_eq!(rx.decrypt(frame).unwrap(), i.to_le_bytes());
            }
            (tx.send_counter(), rx.recv_counter())
        });
    }

    while let Some(res) = tasks.join_next().await {
        assert_eq!(res.unwrap(), (500, 500));
    }
}
