//! WebSocket change feed.
//!
//! One session per connected client, streaming scope-filtered change
//! events as JSON. The event is decoded/encoded exactly once at this
//! boundary; a lagging client gets a `resync` notice and is expected to
//! refetch rather than trust a gapped stream.

use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::api::AppState;
use crate::models::ChangeEvent;
use crate::store::ScopeFilter;

pub struct ChangeFeedSession {
    filter: ScopeFilter,
    feed: Option<broadcast::Receiver<ChangeEvent>>,
    last_heartbeat: Instant,
    ping_interval: Duration,
    client_timeout: Duration,
}

impl ChangeFeedSession {
    pub fn new(
        filter: ScopeFilter,
        feed: broadcast::Receiver<ChangeEvent>,
        ping_interval: Duration,
        client_timeout: Duration,
    ) -> Self {
        Self {
            filter,
            feed: Some(feed),
            last_heartbeat: Instant::now(),
            ping_interval,
            client_timeout,
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(self.ping_interval, |session, ctx| {
            if Instant::now().duration_since(session.last_heartbeat) > session.client_timeout {
                info!("websocket client timed out");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for ChangeFeedSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
        if let Some(feed) = self.feed.take() {
            ctx.add_stream(BroadcastStream::new(feed));
        }
    }
}

impl StreamHandler<Result<ChangeEvent, BroadcastStreamRecvError>> for ChangeFeedSession {
    fn handle(
        &mut self,
        item: Result<ChangeEvent, BroadcastStreamRecvError>,
        ctx: &mut Self::Context,
    ) {
        match item {
            Ok(event) => {
                let admitted = event
                    .body
                    .practice_code()
                    .map(|code| self.filter.admits(code))
                    .unwrap_or(true);
                if !admitted {
                    return;
                }
                match serde_json::to_string(&event) {
                    Ok(json) => ctx.text(json),
                    Err(err) => warn!(error = %err, "failed to encode change event"),
                }
            }
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!(missed, "client feed lagged, requesting resync");
                ctx.text(r#"{"op":"resync"}"#);
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ChangeFeedSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            // The feed is one-way; inbound text/binary is ignored.
            Ok(_) => {}
            Err(_) => ctx.stop(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub practice: Option<String>,
}

pub async fn change_feed(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<FeedQuery>,
) -> Result<HttpResponse, Error> {
    let filter = match &query.practice {
        Some(code) => ScopeFilter::practice(code.clone()),
        None => ScopeFilter::all(),
    };
    let session = ChangeFeedSession::new(
        filter,
        state.store.subscribe(),
        Duration::from_secs(state.websocket.ping_interval_secs),
        Duration::from_secs(state.websocket.client_timeout_secs),
    );
    ws::start(session, &req, stream)
}
