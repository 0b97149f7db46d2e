use async_trait::async_trait;
use flowcore::{ContextAccess, EventEmitter, Node, NodeConfig, NodeContext, NodeError, NodeStatus};
use flowruntime::{NodeFactory, NodeMetadata};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InjectConfig {
    /// Seconds between injections; absent or zero means no repeat
    #[serde(default)]
    repeat: Option<f64>,

    /// Inject once shortly after start
    #[serde(default)]
    once: bool,

    #[serde(default = "default_once_delay")]
    once_delay: f64,

    #[serde(default)]
    payload: Value,
}

fn default_once_delay() -> f64 {
    0.1
}

impl InjectConfig {
    fn from_node(config: &NodeConfig) -> Result<Self, NodeError> {
        let props = Value::Object(config.props.clone());
        let parsed: InjectConfig = serde_json::from_value(props)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        if parsed
            .repeat
            .is_some_and(|r| Duration::try_from_secs_f64(r).is_err())
        {
            return Err(NodeError::Configuration(
                "repeat must be a positive number of seconds".to_string(),
            ));
        }
        if Duration::try_from_secs_f64(parsed.once_delay.max(0.0)).is_err() {
            return Err(NodeError::Configuration(
                "onceDelay is out of range".to_string(),
            ));
        }
        Ok(parsed)
    }

    fn interval(&self) -> Option<Duration> {
        self.repeat
            .filter(|r| *r > 0.0)
            .and_then(|r| Duration::try_from_secs_f64(r).ok())
    }

    fn once_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.once_delay.max(0.0)).unwrap_or_default()
    }
}

/// Timer node. Each injection bumps `count` and stores `payload` in the
/// node's context and reports the count as status.
pub struct InjectNode {
    config: InjectConfig,
    task: Option<JoinHandle<()>>,
}

async fn inject(context: &dyn ContextAccess, events: &EventEmitter, payload: &Value) {
    let count = match context.get("count").await {
        Ok(value) => value.and_then(|v| v.as_u64()).unwrap_or(0) + 1,
        Err(e) => {
            events.error(format!("inject could not read context: {}", e));
            return;
        }
    };
    let stored = async {
        context.set("count", Some(Value::from(count))).await?;
        context.set("payload", Some(payload.clone())).await
    };
    if let Err(e) = stored.await {
        events.error(format!("inject could not write context: {}", e));
        return;
    }
    events.status(NodeStatus::text(format!("injected {}", count)).with_fill("green"));
}

async fn run(
    config: InjectConfig,
    context: Arc<dyn ContextAccess>,
    events: EventEmitter,
    cancellation: CancellationToken,
) {
    if config.once {
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = sleep(config.once_delay()) => {
                inject(context.as_ref(), &events, &config.payload).await;
            }
        }
    }

    let Some(period) = config.interval() else {
        return;
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = ticker.tick() => inject(context.as_ref(), &events, &config.payload).await,
        }
    }
    tracing::debug!(node_id = %events.node_id(), "Inject timer stopped");
}

#[async_trait]
impl Node for InjectNode {
    fn node_type(&self) -> &str {
        "inject"
    }

    async fn start(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        if !self.config.once && self.config.interval().is_none() {
            return Ok(());
        }
        self.task = Some(tokio::spawn(run(
            self.config.clone(),
            ctx.context,
            ctx.events,
            ctx.cancellation,
        )));
        Ok(())
    }

    async fn close(&mut self, _removed: bool) -> Result<(), NodeError> {
        if let Some(task) = self.task.take() {
            // The runtime cancels the token before closing
            task.await
                .map_err(|e| NodeError::CloseFailed(e.to_string()))?;
        }
        Ok(())
    }
}

pub struct InjectNodeFactory;

impl NodeFactory for InjectNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(InjectNode {
            config: InjectConfig::from_node(config)?,
            task: None,
        }))
    }

    fn node_type(&self) -> &str {
        "inject"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Injects a payload on start and/or on a repeating timer".to_string(),
            category: "time".to_string(),
            ..Default::default()
        }
    }
}
