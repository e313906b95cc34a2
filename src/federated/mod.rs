//! Opt-in, differentially private contribution of model deltas.
//!
//! Only the clipped and noised difference between the current feed-forward
//! parameters and the parameters at the previous contribution ever leaves
//! the device. Raw samples and labels are never included.

mod noise;
mod transport;

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::resources::DeviceClass;
use crate::settings::FederatedSettings;

pub use noise::GaussianMechanism;
pub use transport::{FederatedTransport, HttpTransport};

const ANONYMOUS_ID_DOMAIN: &str = "vigil-federated:";

#[derive(Debug, Error)]
pub enum FederatedError {
    #[error("Epsilon must be positive, got {0}")]
    InvalidEpsilon(f64),
    #[error("Delta must be within (0, 1), got {0}")]
    InvalidDelta(f64),
    #[error("Clipping norm must be positive, got {0}")]
    InvalidClipNorm(f64),
    #[error("Noise distribution unavailable: {0}")]
    Noise(String),
    #[error("Contribution baseline has {found} parameters, model has {expected}")]
    BaselineMismatch { expected: usize, found: usize },
    #[error("No aggregation endpoint configured")]
    NoEndpoint,
    #[error("Failed to deliver update to {endpoint}: {message}")]
    Transport { endpoint: String, message: String },
}

/// Federated bookkeeping carried inside the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedState {
    /// Random per-install identifier; never sent as-is.
    pub install_id: Uuid,
    /// Feed-forward parameters at the last contribution.
    pub baseline: Vec<f32>,
    pub contributions: u32,
    /// Privacy loss spent so far under basic composition.
    pub epsilon_spent: f64,
}

impl FederatedState {
    pub fn new(params: &[f32]) -> Self {
        Self {
            install_id: Uuid::new_v4(),
            baseline: params.to_vec(),
            contributions: 0,
            epsilon_spent: 0.0,
        }
    }

    /// Hex SHA-256 of the domain-prefixed install id.
    pub fn anonymous_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ANONYMOUS_ID_DOMAIN.as_bytes());
        hasher.update(self.install_id.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    pub fn remaining_budget(&self, budget: f64) -> f64 {
        (budget - self.epsilon_spent).max(0.0)
    }

    /// Spend `epsilon` and move the baseline to `params`.
    pub fn record_contribution(&mut self, params: &[f32], epsilon: f64) {
        self.baseline = params.to_vec();
        self.contributions += 1;
        self.epsilon_spent += epsilon;
    }
}

/// Payload posted to the aggregator. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedUpdate {
    pub anonymous_id: String,
    /// Clipped, noised parameter delta.
    pub delta: Vec<f32>,
    pub sample_count: usize,
    pub device_class: DeviceClass,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub epsilon: f64,
    /// The mechanism's delta, named apart from the parameter delta.
    pub delta_dp: f64,
}

/// What a session recorded about its contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedSummary {
    pub sample_count: usize,
    pub epsilon: f64,
    pub epsilon_spent: f64,
    pub delivered: bool,
}

/// Prepares and delivers contributions according to [`FederatedSettings`].
pub struct FederatedClient {
    settings: FederatedSettings,
    transport: Option<Box<dyn FederatedTransport>>,
}

impl FederatedClient {
    /// Uses [`HttpTransport`] when an endpoint is configured.
    pub fn from_settings(settings: &FederatedSettings) -> Self {
        let transport = settings
            .endpoint
            .as_ref()
            .map(|endpoint| Box::new(HttpTransport::new(endpoint.clone())) as Box<dyn FederatedTransport>);
        Self {
            settings: settings.clone(),
            transport,
        }
    }

    pub fn with_transport(mut self, transport: Box<dyn FederatedTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn settings(&self) -> &FederatedSettings {
        &self.settings
    }

    pub fn should_contribute_to_federation(&self, state: &FederatedState, sample_count: usize) -> bool {
        self.settings.enabled
            && self.transport.is_some()
            && state.remaining_budget(self.settings.epsilon_budget) >= self.settings.epsilon
            && sample_count >= self.settings.min_samples
    }

    fn mechanism(&self) -> Result<GaussianMechanism, FederatedError> {
        GaussianMechanism::new(self.settings.epsilon, self.settings.delta, self.settings.clip_norm)
    }

    /// Clip `values` and add fresh Gaussian noise; the length is preserved.
    pub fn add_noise(&self, values: &[f32]) -> Result<Vec<f32>, FederatedError> {
        self.mechanism()?.privatize(values, &mut rand::rng())
    }

    /// Package the noised delta between `params` and the contribution baseline.
    pub fn prepare_update(
        &self,
        state: &FederatedState,
        params: &[f32],
        sample_count: usize,
        device_class: DeviceClass,
        now: OffsetDateTime,
    ) -> Result<FederatedUpdate, FederatedError> {
        if state.baseline.len() != params.len() {
            return Err(FederatedError::BaselineMismatch {
                expected: params.len(),
                found: state.baseline.len(),
            });
        }
        let raw: Vec<f32> = params
            .iter()
            .zip(&state.baseline)
            .map(|(current, base)| current - base)
            .collect();
        let mechanism = self.mechanism()?;
        let delta = mechanism.privatize(&raw, &mut rand::rng())?;
        Ok(FederatedUpdate {
            anonymous_id: state.anonymous_id(),
            delta,
            sample_count,
            device_class,
            timestamp: now,
            epsilon: mechanism.epsilon(),
            delta_dp: mechanism.delta(),
        })
    }

    pub fn transmit(&self, update: &FederatedUpdate) -> Result<(), FederatedError> {
        let transport = self.transport.as_ref().ok_or(FederatedError::NoEndpoint)?;
        transport.send(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<FederatedUpdate>>>);

    impl FederatedTransport for Recorder {
        fn send(&self, update: &FederatedUpdate) -> Result<(), FederatedError> {
            self.0.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    fn enabled() -> FederatedSettings {
        FederatedSettings {
            enabled: true,
            ..FederatedSettings::default()
        }
    }

    #[test]
    fn anonymous_id_is_stable_and_unlinkable() {
        let state = FederatedState::new(&[0.0; 4]);
        let id = state.anonymous_id();
        let expected = Sha256::new()
            .chain_update(ANONYMOUS_ID_DOMAIN.as_bytes())
            .chain_update(state.install_id.as_bytes())
            .finalize();
        assert_eq!(id, format!("{expected:x}"));
        assert_eq!(id.len(), 64);
        assert_eq!(id, state.anonymous_id());
        assert!(!id.contains(&state.install_id.simple().to_string()));
        assert_ne!(id, FederatedState::new(&[0.0; 4]).anonymous_id());
    }

    #[test]
    fn contribution_requires_opt_in_endpoint_budget_and_samples() {
        let state = FederatedState::new(&[0.0; 4]);
        let recorder = Recorder::default();

        let disabled = FederatedClient::from_settings(&FederatedSettings::default())
            .with_transport(Box::new(recorder.clone()));
        assert!(!disabled.should_contribute_to_federation(&state, 100));

        let no_endpoint = FederatedClient::from_settings(&enabled());
        assert!(!no_endpoint.should_contribute_to_federation(&state, 100));

        let client = FederatedClient::from_settings(&enabled()).with_transport(Box::new(recorder));
        assert!(client.should_contribute_to_federation(&state, 100));
        assert!(!client.should_contribute_to_federation(&state, 10));

        let mut spent = state.clone();
        spent.epsilon_spent = 9.5;
        assert!(!client.should_contribute_to_federation(&spent, 100));
    }

    #[test]
    fn noise_is_fresh_and_preserves_length() {
        let client = FederatedClient::from_settings(&enabled());
        let values = vec![0.01f32; 128];
        let a = client.add_noise(&values).unwrap();
        let b = client.add_noise(&values).unwrap();
        assert_eq!(a.len(), values.len());
        assert_eq!(b.len(), values.len());
        assert_ne!(a, b);
    }

    #[test]
    fn update_carries_delta_against_baseline() {
        let recorder = Recorder::default();
        let client = FederatedClient::from_settings(&enabled()).with_transport(Box::new(recorder.clone()));
        let mut state = FederatedState::new(&[0.0; 6]);
        let params = [0.1; 6];

        let update = client
            .prepare_update(&state, &params, 80, DeviceClass::High, OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(update.delta.len(), 6);
        assert_eq!(update.sample_count, 80);
        assert_eq!(update.anonymous_id, state.anonymous_id());
        client.transmit(&update).unwrap();
        assert_eq!(recorder.0.lock().unwrap().len(), 1);

        state.record_contribution(&params, update.epsilon);
        assert_eq!(state.baseline, params.to_vec());
        assert_eq!(state.contributions, 1);
        assert_eq!(state.epsilon_spent, 1.0);

        let mismatched = client.prepare_update(&state, &[0.0; 3], 80, DeviceClass::High, OffsetDateTime::UNIX_EPOCH);
        assert!(matches!(mismatched, Err(FederatedError::BaselineMismatch { .. })));
    }
}
