//! Demo saga served by the host: a named counter.

use async_trait::async_trait;
use saga::{CorrelationConfig, HandlerContext, HandlerError, Message, Saga, SagaMessage};
use serde::{Deserialize, Serialize};

/// Adds `amount` to the counter, creating it on first use.
#[derive(Debug, Serialize, Deserialize)]
pub struct Increment {
    pub counter_id: String,
    #[serde(default = "one")]
    pub amount: u64,
}

fn one() -> u64 {
    1
}

impl SagaMessage for Increment {
    const MESSAGE_TYPE: &'static str = "Increment";
}

/// Sets an existing counter back to zero.
#[derive(Debug, Serialize, Deserialize)]
pub struct Reset {
    pub counter_id: String,
}

impl SagaMessage for Reset {
    const MESSAGE_TYPE: &'static str = "Reset";
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CounterData {
    pub counter_id: String,
    pub count: u64,
    pub resets: u32,
}

pub struct CounterSaga;

#[async_trait]
impl Saga for CounterSaga {
    type Data = CounterData;
    const SAGA_TYPE: &'static str = "CounterSaga";

    fn correlate(&self, config: &mut CorrelationConfig) {
        config
            .initiated_by::<Increment>("counter_id", |m| m.counter_id.clone())
            .correlate::<Reset>("counter_id", |m| m.counter_id.clone());
    }

    async fn handle(
        &self,
        data: &mut CounterData,
        message: &Message,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        if message.is::<Increment>() {
            let increment = message.body::<Increment>()?;
            data.count = data
                .count
                .checked_add(increment.amount)
                .ok_or_else(|| HandlerError::failed("counter overflow"))?;
        } else if message.is::<Reset>() {
            data.count = 0;
            data.resets += 1;
        }
        tracing::debug!(saga_id = %ctx.saga_id, count = data.count, "counter updated");
        Ok(())
    }
}
