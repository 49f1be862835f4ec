use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::error::{BoxError, ConditionError, FetchError, PollError};
use crate::metrics::metric_name;
use crate::poll::{poll_until, PollContext, PollPolicy};

/// Client for remote declarative objects of one kind.
///
/// `get` must be side-effect free so it can be retried, and `delete` must
/// tolerate names that are already gone.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    type Object: Send;
    type Spec: Send;

    /// Kind of object served by this client, used in logs.
    fn kind(&self) -> &str;

    async fn get(&self, name: &str) -> Result<Self::Object, FetchError>;

    async fn create(&self, spec: Self::Spec) -> Result<Self::Object, FetchError>;

    async fn delete(&self, names: &[String]) -> Result<(), FetchError>;
}

/// Waits for named remote objects to reach a desired state.
#[derive(Debug, Clone, Default)]
pub struct ResourceWaiter {
    policy: PollPolicy,
}

impl ResourceWaiter {
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Poll `name` until `predicate` accepts it and return the accepted
    /// object.
    ///
    /// A NotFound from the client is retried until the timeout since the
    /// object may simply not have been created yet. Any other fetch error, or
    /// an error from `predicate`, stops the wait.
    pub async fn wait_for_state<C, P>(
        &self,
        ctx: &PollContext,
        client: &C,
        name: &str,
        label: &str,
        predicate: P,
    ) -> Result<C::Object, PollError>
    where
        C: ResourceClient,
        P: FnMut(&C::Object) -> Result<bool, BoxError> + Send,
    {
        let metric = metric_name("WaitForState", name, label);
        log::info!(
            "[{}] Waiting for {} {name:?} to reach state {label:?}",
            ctx.test_name(),
            client.kind()
        );
        wait_with(ctx, &metric, &self.policy, client, name, predicate, true).await
    }

    /// Fetch `name` once and test it with `predicate`. Never sleeps.
    pub async fn check_state<C, P>(
        &self,
        ctx: &PollContext,
        client: &C,
        name: &str,
        label: &str,
        predicate: P,
    ) -> Result<C::Object, PollError>
    where
        C: ResourceClient,
        P: FnMut(&C::Object) -> Result<bool, BoxError> + Send,
    {
        let metric = metric_name("CheckState", name, label);
        wait_with(
            ctx,
            &metric,
            &PollPolicy::single_shot(),
            client,
            name,
            predicate,
            false,
        )
        .await
    }

    /// Poll until the client reports `name` as NotFound.
    pub async fn wait_for_deletion<C>(
        &self,
        ctx: &PollContext,
        client: &C,
        name: &str,
        label: &str,
    ) -> Result<(), PollError>
    where
        C: ResourceClient,
    {
        let metric = metric_name("WaitForDeletion", name, label);
        poll_until(ctx, &metric, &self.policy, || {
            let fetch = client.get(name);
            async move {
                match fetch.await {
                    Err(e) if e.is_not_found() => Ok(Some(())),
                    Err(e) => Err(ConditionError::failed(e)),
                    Ok(_) => Ok(None),
                }
            }
        })
        .await
    }
}

async fn wait_with<C, P>(
    ctx: &PollContext,
    metric: &str,
    policy: &PollPolicy,
    client: &C,
    name: &str,
    predicate: P,
    retry_not_found: bool,
) -> Result<C::Object, PollError>
where
    C: ResourceClient,
    P: FnMut(&C::Object) -> Result<bool, BoxError> + Send,
{
    // Locked only after the fetch completes, never across an await.
    let predicate = Mutex::new(predicate);
    let predicate = &predicate;

    poll_until(ctx, metric, policy, || {
        let fetch = client.get(name);
        async move {
            let object = match fetch.await {
                Ok(object) => object,
                Err(e) if retry_not_found && e.is_not_found() => {
                    log::debug!("[{}] {e}, retrying", ctx.test_name());
                    return Ok(None);
                }
                Err(e) => return Err(ConditionError::failed(e)),
            };

            let mut accept = predicate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match accept(&object) {
                Ok(true) => Ok(Some(object)),
                Ok(false) => Ok(None),
                Err(e) => Err(ConditionError::Failed(e)),
            }
        }
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A single entry of an object's `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusCondition {
    pub fn new(condition_type: &str, status: ConditionStatus) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: None,
            message: None,
        }
    }
}

/// Objects that report reconciliation progress as status conditions.
pub trait HasConditions {
    fn conditions(&self) -> &[StatusCondition];

    fn condition(&self, condition_type: &str) -> Option<&StatusCondition> {
        self.conditions()
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// Predicate accepting objects whose `Ready` condition is `True`.
pub fn is_ready<O: HasConditions>(object: &O) -> Result<bool, BoxError> {
    Ok(object
        .condition("Ready")
        .is_some_and(|c| c.status == ConditionStatus::True))
}

/// Like [`is_ready`], but a `Ready=False` condition carrying a reason stops
/// the wait instead of polling on.
pub fn is_ready_or_failed<O: HasConditions>(object: &O) -> Result<bool, BoxError> {
    match object.condition("Ready") {
        Some(c) if c.status == ConditionStatus::True => Ok(true),
        Some(c) if c.status == ConditionStatus::False && c.reason.is_some() => Err(format!(
            "Ready=False: {}: {}",
            c.reason.as_deref().unwrap_or_default(),
            c.message.as_deref().unwrap_or_default()
        )
        .into()),
        _ => Ok(false),
    }
}
