use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client,
    api::{PostParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};
use tokio_util::sync::CancellationToken;

use corral_types::*;

use super::Error;

const STATUS_RETRY_BUDGET: usize = 5;

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    fn set_last_updated(&mut self, last_updated: Time);

    /// Records the spec generation the status was computed from.
    fn set_observed_generation(&mut self, generation: Option<i64>);
}

impl Object<AgentSessionStatus> for AgentSession {
    fn mut_status(&mut self) -> &mut AgentSessionStatus {
        if self.status.is_some() {
            return self.status.as_mut().unwrap();
        }
        self.status = Some(Default::default());
        self.status.as_mut().unwrap()
    }
}

impl Status for AgentSessionStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }

    fn set_observed_generation(&mut self, generation: Option<i64>) {
        self.observed_generation = generation;
    }
}

/// Writes the resource's status through the status subresource with
/// the provided mutation. The replaced object carries the read's
/// resourceVersion, so a concurrent writer makes this 409; the loser
/// re-reads, re-checks `guard`, and tries again. A guard returning
/// false (e.g. "already terminal") ends the write as a no-op — this is
/// what makes a persisted terminal phase final even under racing
/// writers. `observedGeneration` is stamped from the generation of the
/// object the mutation ran against, never ahead of it.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    guard: impl Fn(&T) -> bool,
    f: impl Fn(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let name = instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))?
        .to_string();
    let namespace = instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))?
        .to_string();
    let api: Api<T> = Api::namespaced(client, &namespace);
    let cancel = CancellationToken::new();

    let mut current = instance.clone();
    for attempt in 0..STATUS_RETRY_BUDGET {
        if !guard(&current) {
            return Ok(current);
        }
        let mut modified = current.clone();
        let generation = modified.meta().generation;
        let status = modified.mut_status();
        f(status);
        status.set_observed_generation(generation);
        status.set_last_updated(Time::from(Timestamp::now()));
        match api
            .replace_status(&name, &PostParams::default(), &modified)
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Lost the optimistic-concurrency race; recompute on a
                // fresh read.
                let _ = corral_common::wait::backoff_step(&cancel, attempt).await;
                current = api.get(&name).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::StatusConflict)
}
