//! End-to-end tests of the subscribe loop against an in-memory service.
//!
//! The fake service answers subscribe polls from a script, in order, and
//! hangs once the script runs out. Every URL it is asked for is reported on
//! a channel so tests can assert what was sent.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use comet_sdk::crypto::CryptoCodec;
use comet_sdk::{
    Client, ClientConfig, Error, Event, HistoryQuery, Listener, Payload, SubscribeOutcome, Transport,
};

/// How long to wait for an event before considering it failed.
const TIMEOUT: Duration = Duration::from_secs(5);

// ── Fake service ─────────────────────────────────────────────────

enum Reply {
    Body(String),
    Fail(Error),
    /// Answer after a delay.
    Delayed(Duration, String),
    Hang,
}

fn body(s: &str) -> Reply {
    Reply::Body(s.to_string())
}

#[derive(Clone)]
struct FakeService {
    polls: Arc<Mutex<VecDeque<Reply>>>,
    routes: Arc<Mutex<Vec<(String, String)>>>,
    calls: mpsc::UnboundedSender<String>,
}

impl FakeService {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let service = Self {
            polls: Arc::default(),
            routes: Arc::default(),
            calls,
        };
        (service, rx)
    }

    fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.polls.lock().extend(replies);
    }

    /// Answer any non-subscribe URL containing `fragment` with `body`.
    fn route(&self, fragment: &str, body: &str) {
        self.routes
            .lock()
            .push((fragment.to_string(), body.to_string()));
    }
}

impl Transport for FakeService {
    fn get(&self, url: &str) -> impl Future<Output = comet_sdk::Result<String>> + Send {
        let _ = self.calls.send(url.to_string());
        let reply = if url.contains("/subscribe/") {
            self.polls.lock().pop_front().unwrap_or(Reply::Hang)
        } else {
            self.routes
                .lock()
                .iter()
                .find(|(fragment, _)| url.contains(fragment.as_str()))
                .map(|(_, b)| Reply::Body(b.clone()))
                .unwrap_or(Reply::Fail(Error::Http { status: 404 }))
        };
        async move {
            match reply {
                Reply::Body(b) => Ok(b),
                Reply::Fail(e) => Err(e),
                Reply::Delayed(d, b) => {
                    tokio::time::sleep(d).await;
                    Ok(b)
                }
                Reply::Hang => std::future::pending().await,
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn config() -> ClientConfig {
    ClientConfig {
        publish_key: "pub-c".into(),
        subscribe_key: "sub-c".into(),
        uuid: Some("tester".into()),
        tls: false,
        domain: "test".into(),
        subscribe_timeout: Duration::from_secs(5),
        retry_interval: Duration::from_millis(10),
        max_retries: 0,
        ..ClientConfig::default()
    }
}

fn client(config: ClientConfig) -> (Client<FakeService>, FakeService, mpsc::UnboundedReceiver<String>) {
    let (service, calls) = FakeService::new();
    let client = Client::with_transport(config, service.clone());
    (client, service, calls)
}

/// Wait for a specific event, ignoring others.
async fn wait_for<F: Fn(&Event) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    predicate: F,
    desc: &str,
) -> Event {
    let result = timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Some(evt) if predicate(&evt) => return evt,
                Some(_) => continue,
                None => panic!("Listener closed while waiting for: {desc}"),
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| panic!("Timeout ({TIMEOUT:?}) waiting for: {desc}"))
}

/// The next event, whatever it is.
async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    wait_for(rx, |_| true, "any event").await
}

/// Wait for the service to be asked for a URL matching `predicate`.
async fn next_call<F: Fn(&str) -> bool>(
    calls: &mut mpsc::UnboundedReceiver<String>,
    predicate: F,
    desc: &str,
) -> String {
    let result = timeout(TIMEOUT, async {
        loop {
            match calls.recv().await {
                Some(url) if predicate(&url) => return url,
                Some(_) => continue,
                None => panic!("Service gone while waiting for: {desc}"),
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| panic!("Timeout ({TIMEOUT:?}) waiting for: {desc}"))
}

async fn next_poll(calls: &mut mpsc::UnboundedReceiver<String>) -> String {
    next_call(calls, |u| u.contains("/subscribe/"), "subscribe poll").await
}

/// Check that no message arrives within `dur`.
async fn assert_no_message(rx: &mut mpsc::UnboundedReceiver<Event>, dur: Duration) {
    let got = timeout(dur, async {
        loop {
            match rx.recv().await {
                Some(evt @ Event::Message { .. }) => return Some(evt),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await;
    if let Ok(Some(evt)) = got {
        panic!("unexpected message: {evt:?}");
    }
}

fn connected(channel: &str, timetoken: &str) -> Event {
    Event::Connected {
        channel: channel.into(),
        timetoken: timetoken.into(),
    }
}

fn text(channel: &str, body: &str) -> Event {
    Event::Message {
        channel: channel.into(),
        payload: Payload::Text(body.into()),
    }
}

// ── Subscribe loop ───────────────────────────────────────────────

#[tokio::test]
async fn bootstrap_connects_then_delivers() {
    let (client, service, mut calls) = client(config());
    service.script([body(r#"[[],"100"]"#), body(r#"[["hello"],"101"]"#)]);

    let (listener, mut rx) = Listener::channel();
    let outcome = client.subscribe(&["a"], &listener).await.unwrap();
    assert_eq!(outcome, SubscribeOutcome::Subscribed);

    assert_eq!(next_event(&mut rx).await, connected("a", "100"));
    assert_eq!(next_event(&mut rx).await, text("a", "hello"));

    let first = next_poll(&mut calls).await;
    assert_eq!(first, "http://pubsub-1.test/subscribe/sub-c/a/0/0?uuid=tester");
    assert!(next_poll(&mut calls).await.ends_with("/subscribe/sub-c/a/0/100?uuid=tester"));
    assert!(next_poll(&mut calls).await.ends_with("/subscribe/sub-c/a/0/101?uuid=tester"));
}

#[tokio::test]
async fn unusable_replies_are_polled_past() {
    let config = ClientConfig {
        retry_interval: Duration::from_millis(150),
        ..config()
    };
    let (client, service, mut calls) = client(config);
    service.script([
        body("<html>bad gateway</html>"),
        body("{}"),
        body(r#"[[],"100"]"#),
    ]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();

    for _ in 0..2 {
        assert!(next_poll(&mut calls).await.ends_with("/a/0/0?uuid=tester"));
    }
    // The second unusable reply holds the next poll back.
    assert!(timeout(Duration::from_millis(75), calls.recv()).await.is_err());
    assert!(next_poll(&mut calls).await.ends_with("/a/0/0?uuid=tester"));
    assert_eq!(next_event(&mut rx).await, connected("a", "100"));
}

#[tokio::test]
async fn messages_follow_the_reply_channel_list() {
    let (client, service, _calls) = client(config());
    service.script([
        body(r#"[[],"1"]"#),
        body(r#"[["for b","for a"],"2","b,a"]"#),
    ]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a", "b"], &listener).await.unwrap();

    wait_for(&mut rx, |e| *e == connected("b", "1"), "b connected").await;
    assert_eq!(next_event(&mut rx).await, text("b", "for b"));
    assert_eq!(next_event(&mut rx).await, text("a", "for a"));
}

#[tokio::test]
async fn transport_failure_recovers_from_saved_cursor() {
    let config = ClientConfig {
        resume_on_reconnect: true,
        ..config()
    };
    let (client, service, mut calls) = client(config);
    service.script([
        body(r#"[[],"100"]"#),
        Reply::Fail(Error::Transport("connection reset".into())),
        body(r#"[[],"900"]"#),
    ]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();

    assert_eq!(next_event(&mut rx).await, connected("a", "100"));
    assert_eq!(
        next_event(&mut rx).await,
        Event::Error {
            channel: "a".into(),
            error: Error::Transport("connection reset".into())
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        Event::Reconnected {
            channel: "a".into(),
            timetoken: "100".into()
        }
    );

    let polls = [
        next_poll(&mut calls).await,
        next_poll(&mut calls).await,
        next_poll(&mut calls).await,
        next_poll(&mut calls).await,
    ];
    assert!(polls[0].ends_with("/a/0/0?uuid=tester"));
    assert!(polls[1].ends_with("/a/0/100?uuid=tester"));
    assert!(polls[2].ends_with("/a/0/0?uuid=tester"));
    assert!(polls[3].ends_with("/a/0/100?uuid=tester"));

    // Recovery moves to another origin host.
    assert!(polls[0].starts_with("http://pubsub-1.test/"));
    assert!(polls[1].starts_with("http://pubsub-1.test/"));
    assert!(polls[2].starts_with("http://pubsub-"));
    assert!(!polls[2].starts_with("http://pubsub-1.test/"));
    assert!(polls[3].starts_with(polls[2].split("/subscribe/").next().unwrap()));
}

#[tokio::test]
async fn timeout_announces_disconnect_then_reconnect() {
    let config = ClientConfig {
        subscribe_timeout: Duration::from_millis(100),
        max_retries: 1,
        ..config()
    };
    let (client, service, _calls) = client(config);
    service.script([body(r#"[[],"5"]"#), Reply::Hang, body(r#"[["m"],"6"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();

    assert_eq!(next_event(&mut rx).await, connected("a", "5"));
    assert_eq!(
        next_event(&mut rx).await,
        Event::Disconnected {
            channel: "a".into(),
            timetoken: "0".into()
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        Event::Reconnected {
            channel: "a".into(),
            timetoken: "6".into()
        }
    );
    assert_eq!(next_event(&mut rx).await, text("a", "m"));
}

#[tokio::test]
async fn exhausted_timeouts_surface_an_error() {
    let config = ClientConfig {
        subscribe_timeout: Duration::from_millis(100),
        resume_on_reconnect: true,
        ..config()
    };
    let (client, service, _calls) = client(config);
    service.script([body(r#"[[],"5"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();

    assert_eq!(next_event(&mut rx).await, connected("a", "5"));
    assert_eq!(
        next_event(&mut rx).await,
        Event::Disconnected {
            channel: "a".into(),
            timetoken: "5".into()
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        Event::Error {
            channel: "a".into(),
            error: Error::Timeout
        }
    );
    assert_eq!(client.subscribed_channels().await.unwrap(), vec!["a"]);
}

#[tokio::test]
async fn adding_a_channel_suppresses_the_superseded_poll() {
    let (client, service, mut calls) = client(config());
    service.script([
        body(r#"[[],"1"]"#),
        Reply::Delayed(Duration::from_millis(200), r#"[["stale"],"2"]"#.into()),
        body(r#"[[],"3"]"#),
    ]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();
    assert_eq!(next_event(&mut rx).await, connected("a", "1"));
    next_poll(&mut calls).await;
    next_poll(&mut calls).await;

    client.subscribe(&["b"], &listener).await.unwrap();
    let restarted = next_poll(&mut calls).await;
    assert!(restarted.contains("/subscribe/sub-c/a%2Cb/0/0"), "{restarted}");

    assert_eq!(next_event(&mut rx).await, connected("b", "3"));
    assert_no_message(&mut rx, Duration::from_millis(400)).await;
}

#[tokio::test]
async fn already_listening_does_not_restart() {
    let (client, service, mut calls) = client(config());
    service.script([body(r#"[[],"1"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();
    assert_eq!(next_event(&mut rx).await, connected("a", "1"));
    next_poll(&mut calls).await;
    next_poll(&mut calls).await;

    let outcome = client.subscribe(&["a"], &listener).await.unwrap();
    assert_eq!(outcome, SubscribeOutcome::AlreadyListening);
    assert!(timeout(Duration::from_millis(200), calls.recv()).await.is_err());
}

#[tokio::test]
async fn unsubscribe_leaves_and_goes_idle() {
    let (client, service, mut calls) = client(config());
    service.script([body(r#"[[],"1"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a", "b"], &listener).await.unwrap();
    wait_for(&mut rx, |e| *e == connected("b", "1"), "b connected").await;

    assert_eq!(client.unsubscribe(&["a", "ghost"]).await.unwrap(), vec!["a"]);
    let (mut leave, mut poll) = (None, None);
    while leave.is_none() || poll.is_none() {
        let url = next_call(&mut calls, |_| true, "leave and restarted poll").await;
        if url.contains("/leave") {
            leave = Some(url);
        } else if url.contains("/subscribe/sub-c/b/") {
            poll = Some(url);
        }
    }
    assert_eq!(
        leave.as_deref(),
        Some("http://pubsub-1.test/v2/presence/sub_key/sub-c/channel/a/leave?uuid=tester")
    );
    assert!(poll.is_some_and(|p| p.ends_with("/b/0/0?uuid=tester")));

    assert_eq!(client.unsubscribe(&["b"]).await.unwrap(), vec!["b"]);
    assert!(client.unsubscribe(&["b"]).await.unwrap().is_empty());
    assert!(client.subscribed_channels().await.unwrap().is_empty());
}

#[tokio::test]
async fn presence_channels_use_the_suffix() {
    let (client, service, mut calls) = client(config());
    service.script([body(r#"[[],"1"]"#), body(r#"[[{"action":"join","uuid":"u2"}],"2","room-pnpres"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.presence("room", &listener).await.unwrap();
    assert!(next_poll(&mut calls).await.contains("/subscribe/sub-c/room-pnpres/"));

    assert_eq!(next_event(&mut rx).await, connected("room-pnpres", "1"));
    assert_eq!(
        next_event(&mut rx).await,
        Event::Message {
            channel: "room-pnpres".into(),
            payload: Payload::Structured(json!({"action": "join", "uuid": "u2"})),
        }
    );
    assert_eq!(client.unsubscribe_presence("room").await.unwrap(), vec!["room-pnpres"]);
}

#[tokio::test]
async fn disconnect_and_resubscribe_notifies_channels() {
    let (client, service, mut calls) = client(config());
    service.script([body(r#"[[],"1"]"#), Reply::Hang, body(r#"[[],"7"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();
    assert_eq!(next_event(&mut rx).await, connected("a", "1"));
    next_poll(&mut calls).await;
    next_poll(&mut calls).await;

    client.disconnect_and_resubscribe().await.unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        Event::Error {
            channel: "a".into(),
            error: Error::Disconnected
        }
    );
    assert_eq!(
        next_event(&mut rx).await,
        Event::Reconnected {
            channel: "a".into(),
            timetoken: "7".into()
        }
    );
}

#[tokio::test]
async fn auth_key_change_restarts_the_stream() {
    let (client, service, mut calls) = client(config());
    service.script([body(r#"[[],"1"]"#)]);

    let (listener, mut rx) = Listener::channel();
    client.subscribe(&["a"], &listener).await.unwrap();
    assert_eq!(next_event(&mut rx).await, connected("a", "1"));
    next_poll(&mut calls).await;
    next_poll(&mut calls).await;

    client.set_auth_key(Some("secret token")).await.unwrap();
    assert_eq!(client.auth_key().as_deref(), Some("secret token"));
    let poll = next_poll(&mut calls).await;
    assert!(poll.ends_with("/a/0/0?uuid=tester&auth=secret%20token"), "{poll}");
}

#[tokio::test]
async fn invalid_arguments_fail_before_any_request() {
    let (client, _service, mut calls) = client(config());
    let (listener, _rx) = Listener::channel();

    let empty: [&str; 0] = [];
    assert!(matches!(
        client.subscribe(&empty, &listener).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe(&[""], &listener).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.subscribe(&["a,b"], &listener).await,
        Err(Error::InvalidArgument(_))
    ));

    let (closed, rx) = Listener::channel();
    drop(rx);
    assert!(matches!(
        client.subscribe(&["a"], &closed).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.publish("", &json!("x")).await,
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        client.unsubscribe(&empty).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.unsubscribe(&[""]).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        client.unsubscribe_presence("").await,
        Err(Error::InvalidArgument(_))
    ));

    assert!(timeout(Duration::from_millis(100), calls.recv()).await.is_err());
}

#[tokio::test]
async fn shutdown_closes_every_handle() {
    let (client, _service, _calls) = client(config());
    let other = client.clone();
    client.shutdown().await.unwrap();

    let (listener, _rx) = Listener::channel();
    assert_eq!(other.subscribe(&["a"], &listener).await, Err(Error::Closed));
}

// ── One-shot calls ───────────────────────────────────────────────

#[tokio::test]
async fn publish_encrypts_and_quotes() {
    let config = ClientConfig {
        cipher_key: Some("enigma".into()),
        ..config()
    };
    let (client, service, mut calls) = client(config);
    service.route("/publish/", r#"[1,"Sent","13769502243124018"]"#);

    let receipt = client.publish("news", &json!({"n": 1})).await.unwrap();
    assert_eq!(receipt.status, 1);
    assert_eq!(receipt.timetoken, "13769502243124018");

    let url = next_call(&mut calls, |u| u.contains("/publish/"), "publish").await;
    let prefix = "http://pubsub-1.test/publish/pub-c/sub-c/0/news/0/%22";
    assert!(url.starts_with(prefix), "{url}");
}

#[tokio::test]
async fn history_and_presence_calls() {
    let config = ClientConfig {
        cipher_key: Some("enigma".into()),
        ..config()
    };
    let codec = CryptoCodec::new(Some("enigma"));
    let (client, service, _calls) = client(config);

    let stored = json!([codec.encode("first").unwrap()]).to_string();
    service.route("/history/sub-c/", &stored);
    let page = json!([[codec.encode(r#"{"k":true}"#).unwrap()], 10, 20]).to_string();
    service.route("/v2/history/", &page);
    service.route("/v2/presence/", r#"{"uuids":["tester"],"occupancy":1}"#);
    service.route("/time/0", "[16000000000000000]");

    assert_eq!(
        client.history("a", 1).await.unwrap(),
        vec![Payload::Text("first".into())]
    );
    let page = client
        .detailed_history("a", &HistoryQuery::default())
        .await
        .unwrap();
    assert_eq!(page.messages, vec![Payload::Structured(json!({"k": true}))]);
    assert_eq!((page.start.as_str(), page.end.as_str()), ("10", "20"));
    assert_eq!(client.here_now("a").await.unwrap().occupancy, 1);
    assert_eq!(client.time().await.unwrap(), "16000000000000000");
}

#[tokio::test]
async fn one_shot_errors_are_returned() {
    let (client, service, _calls) = client(config());
    service.route("/time/0", "not json");

    assert_eq!(client.here_now("a").await, Err(Error::Http { status: 404 }));
    assert!(matches!(client.time().await, Err(Error::Parsing(_))));
}
