//! Client facade over the engine
//!
//! Each call dispatches exactly one initiating action and waits for its
//! completion. Waiting needs something to deliver the counterparty's reply to
//! the engine while the call is pending.

use std::sync::Arc;
use tandem_core::{
    Address, AppId, AppState, ClientActionMessage, InstallParams, ProtocolPayload, RequestId,
    UninstallParams, UpdateParams,
};
use tandem_state::{AppChannelState, ChannelState, FreeBalanceState};

use crate::engine::{Completion, DispatchOutcome, ProtocolEngine};
use crate::error::ProtocolError;

/// Entry point for opening channels
#[derive(Debug, Clone)]
pub struct ChannelClient {
    engine: Arc<ProtocolEngine>,
}

impl ChannelClient {
    /// Wrap an engine
    pub fn new(engine: Arc<ProtocolEngine>) -> Self {
        Self { engine }
    }

    /// Open a channel with `counterparty` at `multisig`
    pub async fn setup(
        &self,
        counterparty: Address,
        multisig: Address,
    ) -> Result<ChannelHandle, ProtocolError> {
        let handle = self.channel(counterparty, multisig);
        handle.dispatch(None, ProtocolPayload::Setup).await?;
        Ok(handle)
    }

    /// Handle to an existing channel
    pub fn channel(&self, counterparty: Address, multisig: Address) -> ChannelHandle {
        ChannelHandle {
            engine: self.engine.clone(),
            counterparty,
            multisig,
        }
    }
}

/// Options for installing an app
#[derive(Debug, Clone, PartialEq)]
pub struct InstallOptions {
    /// Local deposit into the app
    pub peer_a_balance: u64,
    /// Counterparty deposit into the app
    pub peer_b_balance: u64,
    /// Initial app state
    pub state: AppState,
}

impl InstallOptions {
    /// Install with no deposits
    pub fn with_state(state: AppState) -> Self {
        Self {
            peer_a_balance: 0,
            peer_b_balance: 0,
            state,
        }
    }
}

/// One open channel
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    engine: Arc<ProtocolEngine>,
    counterparty: Address,
    multisig: Address,
}

impl ChannelHandle {
    /// Channel address
    pub fn multisig_address(&self) -> &Address {
        &self.multisig
    }

    /// Install an app channel
    pub async fn install(
        &self,
        app_name: &str,
        options: InstallOptions,
    ) -> Result<AppHandle, ProtocolError> {
        let payload = ProtocolPayload::Install(InstallParams {
            app_name: app_name.to_string(),
            peer_a_balance: options.peer_a_balance,
            peer_b_balance: options.peer_b_balance,
            state: options.state,
        });
        let completion = self.dispatch(None, payload).await?;
        let app_id = completion.app_id.ok_or_else(|| {
            ProtocolError::invalid_step("install", "commit reported no app id")
        })?;
        Ok(self.app(app_id))
    }

    /// Handle to an installed app
    pub fn app(&self, app_id: AppId) -> AppHandle {
        AppHandle {
            channel: self.clone(),
            app_id,
        }
    }

    /// Free balance of this channel
    pub fn query_free_balance(&self) -> Result<FreeBalanceState, ProtocolError> {
        Ok(self.engine.channels().query_free_balance(&self.multisig)?)
    }

    /// Full state of this channel
    pub fn query_state_channel(&self) -> Result<ChannelState, ProtocolError> {
        Ok(self.engine.channels().query_state_channel(&self.multisig)?)
    }

    async fn dispatch(
        &self,
        app_id: Option<AppId>,
        payload: ProtocolPayload,
    ) -> Result<Completion, ProtocolError> {
        let request_id = RequestId::random();
        let message = ClientActionMessage::initiate(
            self.engine.me().clone(),
            self.counterparty.clone(),
            self.multisig.clone(),
            app_id,
            request_id.clone(),
            payload,
        );

        let completion = self.engine.subscribe(&request_id);
        match self.engine.execute(message).await? {
            DispatchOutcome::Committed(done) => Ok(done),
            DispatchOutcome::Suspended { .. } => completion
                .await
                .map_err(|_| ProtocolError::Abandoned(request_id))?,
        }
    }
}

/// One installed app channel
#[derive(Debug, Clone)]
pub struct AppHandle {
    channel: ChannelHandle,
    app_id: AppId,
}

impl AppHandle {
    /// App identifier
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Replace the app state
    pub async fn update(&self, state: AppState) -> Result<Completion, ProtocolError> {
        self.channel
            .dispatch(
                Some(self.app_id.clone()),
                ProtocolPayload::Update(UpdateParams { state }),
            )
            .await
    }

    /// Remove the app, crediting `settlement` to the free balance
    pub async fn uninstall(&self, settlement: UninstallParams) -> Result<Completion, ProtocolError> {
        self.channel
            .dispatch(
                Some(self.app_id.clone()),
                ProtocolPayload::Uninstall(settlement),
            )
            .await
    }

    /// Current state of this app channel
    pub fn state(&self) -> Result<AppChannelState, ProtocolError> {
        let channel = self.channel.query_state_channel()?;
        Ok(channel.app(&self.app_id)?.clone())
    }
}
