use crate::engine::{Engine, EngineError};
use std::sync::Arc;
use std::time::Duration;
use zbus::interface;

/// D-Bus interface for the faceid daemon.
///
/// Bus name: org.faceid.FaceId1
/// Object path: /org/faceid/FaceId1
pub struct FaceIdService {
    pub engine: Arc<Engine>,
    pub verify_timeout: Duration,
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e.code() {
        "InvalidName" => zbus::fdo::Error::InvalidArgs(e.to_string()),
        code => zbus::fdo::Error::Failed(format!("{code}: {e}")),
    }
}

#[interface(name = "org.faceid.FaceId1")]
impl FaceIdService {
    /// Capture samples of the face in view and register them under `name`.
    /// Returns a JSON object with the name and number of stored templates.
    async fn enroll(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "D-Bus enroll");
        let registered = self.engine.enroll(name).await.map_err(to_fdo)?;
        serde_json::to_string(&registered).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Verify the face in view against the identity `name`.
    async fn verify(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "D-Bus verify");
        let matched = self
            .engine
            .verify(name, self.verify_timeout)
            .await
            .map_err(to_fdo)?;
        tracing::info!(name, matched, "verify finished");
        Ok(matched)
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.store().names().map_err(|e| to_fdo(e.into()))?;
        let settings = self.engine.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": identities.len(),
            "match_threshold": settings.match_threshold,
            "tick_interval_ms": settings.tick_interval.as_millis() as u64,
            "pass_window": settings.pass_window,
            "passes_required": settings.passes_required,
            "gallery_scope": settings.gallery_scope,
            "health": self.engine.health(),
        })
        .to_string())
    }

    /// List registered identities as a JSON array.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.list().map_err(to_fdo)?;
        serde_json::to_string(&identities).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove an identity. Returns false if it was not registered.
    async fn remove_identity(&self, name: &str) -> zbus::fdo::Result<bool> {
        let removed = self.engine.remove(name).map_err(to_fdo)?;
        tracing::info!(name, removed, "D-Bus remove_identity");
        Ok(removed)
    }
}
