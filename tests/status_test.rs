use formula_bar::api::ApiClient;
use formula_bar::config::Endpoints;
use formula_bar::status::{StatusBoard, StatusListener, StatusOutcome, StatusUpdate, StreamEnd};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn sse_server(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/formulation/stream"))
        .and(query_param("query", "hydrating serum"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream"))
        .mount(&server)
        .await;
    server
}

async fn collect(server_uri: &str, cancel: CancellationToken) -> (StreamEnd, Vec<StatusUpdate>) {
    let client = ApiClient::new(Endpoints::new(server_uri));
    let mut updates = Vec::new();
    let end = StatusListener::new(client, "hydrating serum", cancel)
        .run(&mut updates)
        .await;
    (end, updates)
}

#[tokio::test]
async fn test_listener_stops_at_done() {
    let server = sse_server(concat!(
        "data: {\"stage\":\"enhancement\",\"message\":\"Refining your formulation request\"}\n\n",
        "data: {\"stage\":\"analyzing\",\"message\":\"Checking compatibility\"}\n\n",
        "data: {\"stage\":\"done\",\"message\":\"Formulation complete!\"}\n\n",
        "data: {\"stage\":\"late\",\"message\":\"should never be seen\"}\n\n",
    ))
    .await;

    let (end, updates) = collect(&server.uri(), CancellationToken::new()).await;

    assert_eq!(end, StreamEnd::Done);
    assert_eq!(updates.len(), 3);

    let mut board = StatusBoard::default();
    board.begin();
    let mut outcomes = Vec::new();
    for update in updates {
        if let StatusUpdate::Event(event) = update {
            outcomes.push(board.apply(event));
            if outcomes.len() == 2 {
                assert_eq!(board.text(), "Checking compatibility");
            }
        }
    }
    assert!(matches!(
        &outcomes[..],
        [StatusOutcome::Updated, StatusOutcome::Updated, StatusOutcome::Done(_)]
    ));
    assert_eq!(board.text(), "Formulation complete!");
}

#[tokio::test]
async fn test_malformed_event_keeps_stream_alive() {
    let server = sse_server(concat!(
        "data: {\"stage\":\"retrieval\",\"message\":\"Consulting\"}\n\n",
        "data: {not json\n\n",
        "data: {\"stage\":\"done\",\"message\":\"Formulation complete!\"}\n\n",
    ))
    .await;

    let (end, updates) = collect(&server.uri(), CancellationToken::new()).await;

    assert_eq!(end, StreamEnd::Done);
    assert!(matches!(&updates[1], StatusUpdate::Malformed(data) if data == "{not json"));

    // The malformed payload leaves the previous display untouched.
    let mut board = StatusBoard::default();
    board.begin();
    if let StatusUpdate::Event(event) = updates[0].clone() {
        board.apply(event);
    }
    assert_eq!(board.text(), "Consulting");
}

#[tokio::test]
async fn test_stream_closed_without_done() {
    let server = sse_server("data: {\"stage\":\"synthesis\",\"message\":\"Composing\"}\n\n").await;

    let (end, updates) = collect(&server.uri(), CancellationToken::new()).await;

    assert_eq!(end, StreamEnd::Closed);
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn test_server_error_reports_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/formulation/stream"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (end, updates) = collect(&server.uri(), CancellationToken::new()).await;

    assert_eq!(end, StreamEnd::Failed);
    assert!(matches!(&updates[..], [StatusUpdate::TransportError(_)]));
}

#[tokio::test]
async fn test_unreachable_stream_fails_quietly() {
    let (end, updates) = collect("http://127.0.0.1:1", CancellationToken::new()).await;
    assert_eq!(end, StreamEnd::Failed);
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn test_cancel_closes_pending_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/formulation/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("data: {\"stage\":\"done\",\"message\":\"\"}\n\n", "text/event-stream")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let (end, updates) = tokio::time::timeout(Duration::from_secs(5), collect(&server.uri(), cancel))
        .await
        .expect("listener did not honour cancellation");

    assert_eq!(end, StreamEnd::Cancelled);
    assert!(updates.is_empty());
}

#[tokio::test]
async fn test_slow_receiver_gets_every_event_through_done() {
    let mut body = String::new();
    for i in 0..40 {
        body.push_str(&format!(
            "data: {{\"stage\":\"step-{}\",\"message\":\"Working on step {}\"}}\n\n",
            i, i
        ));
    }
    body.push_str("data: {\"stage\":\"done\",\"message\":\"Formulation complete!\"}\n\n");
    let server = sse_server(&body).await;

    let client = ApiClient::new(Endpoints::new(&server.uri()));
    let (tx, mut rx) = mpsc::channel(1);
    let listener = tokio::spawn(
        StatusListener::new(client, "hydrating serum", CancellationToken::new()).run(PollSender::new(tx)),
    );

    let mut received = Vec::new();
    while let Some(update) = rx.recv().await {
        tokio::time::sleep(Duration::from_millis(2)).await;
        received.push(update);
    }

    assert_eq!(listener.await.unwrap(), StreamEnd::Done);
    assert_eq!(received.len(), 41);
    assert!(matches!(&received[39], StatusUpdate::Event(e) if e.stage == "step-39"));
    assert!(matches!(received.last(), Some(StatusUpdate::Event(e)) if e.is_done()));

    let mut board = StatusBoard::new(Duration::from_millis(20));
    let attempt = board.begin();
    let mut hide = None;
    for update in received {
        if let StatusUpdate::Event(event) = update {
            if let StatusOutcome::Done(request) = board.apply(event) {
                hide = Some(request);
            }
        }
    }
    let hide = hide.expect("done event should request a hide");
    assert_eq!(hide.attempt, attempt);
    board.hide(hide.wait().await);
    assert!(!board.is_visible());
}
