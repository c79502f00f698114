//! Authenticator that delegates each step to an external credential command.
//!
//! The command is taken from the identity's `command` parameter (with
//! optional `args`) and must print `{"secret": ..., "expires_at": ...}` on
//! stdout. Context is passed through the environment:
//!
//! ```text
//! CREDCHAIN_IDENTITY        name of the identity being authenticated
//! CREDCHAIN_IDENTITY_KIND   its kind
//! CREDCHAIN_PARAMS          its parameters as JSON
//! CREDCHAIN_CHAIN           comma-separated chain, root first
//! CREDCHAIN_PARENT          parent identity (chained steps only)
//! CREDCHAIN_PARENT_SECRET   parent credentials (chained steps only)
//! CREDCHAIN_SSO_*           start URL, region and scopes (device flow only)
//! ```
//!
//! Exit status 75 (EX_TEMPFAIL) is a transient failure and is retried; any
//! other non-zero status rejects the step with the command's stderr.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::process::Command;

use crate::auth::authenticator::{IdentityAuthenticator, StepRequest};
use crate::auth::error::StepError;
use crate::auth::sso::{DeviceAuthorization, SsoParams};
use crate::auth::types::{Identity, StepOutput};

/// Exit status a command uses to ask for a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Deserialize)]
struct CommandOutput {
    secret: String,
    expires_at: DateTime<Utc>,
}

/// Runs `params.command` for every step it is registered for.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandAuthenticator;

impl CommandAuthenticator {
    pub fn new() -> Self {
        Self
    }

    fn command_for(identity: &Identity) -> Result<(String, Vec<String>), StepError> {
        let program = identity
            .param_str("command")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                StepError::InvalidConfig(format!("{} has no command configured", identity.name))
            })?;

        let args = match identity.params.get("args") {
            None => Vec::new(),
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        StepError::InvalidConfig(format!(
                            "{}: command args must be strings",
                            identity.name
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(StepError::InvalidConfig(format!(
                    "{}: args must be a list",
                    identity.name
                )))
            }
        };

        Ok((program.to_string(), args))
    }

    async fn run(
        &self,
        identity: &Identity,
        env: Vec<(&'static str, String)>,
    ) -> Result<StepOutput, StepError> {
        let (program, args) = Self::command_for(identity)?;
        let params = serde_json::to_string(&identity.params)
            .map_err(|e| StepError::InvalidConfig(e.to_string()))?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env("CREDCHAIN_IDENTITY", &identity.name)
            .env("CREDCHAIN_IDENTITY_KIND", identity.kind.to_string())
            .env("CREDCHAIN_PARAMS", params)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running credential command for {}: {}", identity.name, program);
        let output = command.output().await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                StepError::InvalidConfig(format!("cannot run {}: {}", program, e))
            }
            _ => StepError::Network(format!("failed to run {}: {}", program, e)),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match output.status.code() {
                Some(EXIT_TEMPFAIL) => StepError::Network(stderr),
                code => {
                    let reason = if stderr.is_empty() {
                        match code {
                            Some(code) => format!("{} exited with status {}", program, code),
                            None => format!("{} was terminated by a signal", program),
                        }
                    } else {
                        stderr
                    };
                    StepError::rejected(
                        reason,
                        format!("check the credential command configured for {}", identity.name),
                    )
                }
            });
        }

        let parsed: CommandOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            StepError::rejected(
                format!("unreadable output from {}: {}", program, e),
                "the command must print {\"secret\": ..., \"expires_at\": ...}",
            )
        })?;
        Ok(StepOutput::new(parsed.secret, parsed.expires_at))
    }
}

#[async_trait]
impl IdentityAuthenticator for CommandAuthenticator {
    fn validate(&self, identity: &Identity) -> Result<(), StepError> {
        Self::command_for(identity).map(|_| ())
    }

    async fn authenticate(&self, request: &StepRequest<'_>) -> Result<StepOutput, StepError> {
        let mut env = vec![("CREDCHAIN_CHAIN", request.chain.names().join(","))];
        if request.index > 0 {
            let parent = request.require_parent()?;
            env.push(("CREDCHAIN_PARENT", parent.owner().to_string()));
            env.push((
                "CREDCHAIN_PARENT_SECRET",
                parent.secret().expose_secret().clone(),
            ));
        }
        self.run(request.identity, env).await
    }
}

#[async_trait]
impl DeviceAuthorization for CommandAuthenticator {
    async fn authorize(
        &self,
        provider: &Identity,
        params: &SsoParams,
    ) -> Result<StepOutput, StepError> {
        let env = vec![
            ("CREDCHAIN_CHAIN", provider.name.clone()),
            ("CREDCHAIN_SSO_START_URL", params.start_url.clone()),
            ("CREDCHAIN_SSO_REGION", params.region.clone()),
            ("CREDCHAIN_SSO_SCOPES", params.scopes.join(",")),
        ];
        self.run(provider, env).await
    }
}
