use std::sync::Arc;
use std::time::Duration;

use creative_harness::analyst::{
    AnalystError, CorpusEntry, CreativeAnalyst, DiscoveryDomain, LlmAnalyst, MergeBrief,
};
use creative_harness::gateway::openrouter::OpenRouterAdapter;
use creative_harness::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "anthropic/claude-sonnet-4.5";

fn analyst(server: &MockServer) -> LlmAnalyst {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(0),
        },
    );
    LlmAnalyst::new(Arc::new(gateway), MODEL)
}

fn corpus() -> Vec<CorpusEntry> {
    (1..=3)
        .map(|i| CorpusEntry {
            item_id: format!("ad_{i:03}.jpg"),
            text: "Visual: kitchen counter\nMessage: saves time".to_string(),
        })
        .collect()
}

/// Server-sent events carrying `content` in two deltas.
fn streamed(content: &str, finish_reason: &str, completion_tokens: u32) -> String {
    let (head, tail) = content.split_at(content.len() / 2);
    let events = [
        json!({"choices": [{"delta": {"content": head}, "finish_reason": null}]}),
        json!({"choices": [{"delta": {"content": tail}, "finish_reason": finish_reason}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 900, "completion_tokens": completion_tokens}}),
    ];
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn discovery_cut_off_by_output_ceiling_fails_without_retry() {
    let server = MockServer::start().await;
    let body = streamed(r#"{"rationale": "three angles", "categories": [{"name": "pa"#, "length", 16_384);

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"max_tokens\":16384"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let err = analyst(&server)
        .discover_groups(DiscoveryDomain::CreativeConcepts, &corpus())
        .await
        .unwrap_err();

    match err {
        AnalystError::OutputExhausted {
            caller,
            max_tokens,
            output_tokens,
        } => {
            assert_eq!(caller, "analyst::discover");
            assert_eq!(max_tokens, Some(16_384));
            assert_eq!(output_tokens, 16_384);
        }
        other => panic!("expected OutputExhausted, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn discovery_streams_and_keeps_first_of_duplicate_names() {
    let server = MockServer::start().await;
    let content = json!({
        "rationale": "pain-led and proof-led angles",
        "categories": [
            {"name": "pain", "display_name": "Pain", "description": "names the problem"},
            {"name": "proof", "display_name": "Proof", "description": "shows results"},
            {"name": "pain", "display_name": "Pain again", "description": "duplicate"}
        ]
    })
    .to_string();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(streamed(&content, "stop", 120), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let discovery = analyst(&server)
        .discover_groups(DiscoveryDomain::VideoHooks, &corpus())
        .await
        .unwrap();
    let names: Vec<&str> = discovery.categories.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["pain", "proof"]);
    assert_eq!(discovery.categories[0].display_name, "Pain");
    assert_eq!(discovery.rationale, "pain-led and proof-led angles");

    let received = server.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(sent["max_tokens"], 8_192);
    assert_eq!(sent["stream"], true);
}

#[tokio::test]
async fn merge_call_streams_its_partition() {
    let server = MockServer::start().await;
    let content = json!({
        "groups": [
            {"name": "lifestyle", "rationale": "people in scene", "members": ["a.png", "b.png"]},
            {"name": "studio", "rationale": "plain backdrop", "members": ["c.png"]}
        ]
    })
    .to_string();

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("\"stream\":true"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(streamed(&content, "stop", 80), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let brief = MergeBrief {
        scope: "All 3".to_string(),
        batches: 2,
        text: "## Batch 1\n- lifestyle: a.png, b.png\n\n## Batch 2\n- studio: c.png".to_string(),
        total_items: 3,
        max_output_tokens: 4_096,
    };
    let groups = analyst(&server).merge_groups(&brief).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].name, "lifestyle");
    assert_eq!(groups[0].members, vec!["a.png", "b.png"]);
    assert_eq!(groups[1].members, vec!["c.png"]);
}
