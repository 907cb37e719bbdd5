use std::sync::Arc;

use web_time::Duration;

use crate::callbacks::SessionCallbacks;
use crate::input_queue::{PredictionStrategy, RepeatLastConfirmed, MAX_FRAME_DELAY};
use crate::network::protocol::EndpointSettings;
use crate::sessions::config::{ProtocolConfig, SpectatorConfig, SyncConfig};
use crate::time_sync::TimeSyncConfig;
use crate::{
    DesyncDetection, NonBlockingSocket, P2PSession, PeerAddress, SessionError, SessionLogger,
    SpectatorSession, SyncTestSession, MAX_PLAYERS, MAX_PREDICTION_FRAMES,
};

const DEFAULT_PLAYERS: usize = 2;
const DEFAULT_INPUT_DELAY: usize = 0;
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(500);
const DEFAULT_FPS: usize = 60;
/// Events older than this are dropped if the host does not drain them.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 100;

/// Collects the parameters of a session before it is started.
///
/// Start a session through [`SessionManager`](crate::SessionManager) or directly with
/// one of the `start_*` methods.
///
/// ```
/// use rollback_session::{DesyncDetection, SessionBuilder};
/// use web_time::Duration;
///
/// let builder = SessionBuilder::new("arena-v3")
///     .with_num_players(2)?
///     .with_input_delay(2)?
///     .with_disconnect_timeout(Duration::from_millis(3000))
///     .with_desync_detection(DesyncDetection::On { interval: 30 });
/// assert_eq!(builder.num_players(), 2);
/// # Ok::<(), rollback_session::SessionError>(())
/// ```
#[must_use = "SessionBuilder must be consumed by starting a session"]
#[derive(Clone)]
pub struct SessionBuilder {
    pub(crate) game: String,
    pub(crate) num_players: usize,
    pub(crate) max_prediction: usize,
    pub(crate) fps: usize,
    pub(crate) input_delay: usize,
    pub(crate) disconnect_timeout: Duration,
    pub(crate) disconnect_notify_start: Duration,
    pub(crate) desync_detection: DesyncDetection,
    pub(crate) prediction: Arc<dyn PredictionStrategy>,
    pub(crate) logger: SessionLogger,
    pub(crate) sync_config: SyncConfig,
    pub(crate) protocol_config: ProtocolConfig,
    pub(crate) spectator_config: SpectatorConfig,
    pub(crate) time_sync_config: TimeSyncConfig,
    pub(crate) event_queue_size: usize,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            game,
            num_players,
            max_prediction,
            fps,
            input_delay,
            disconnect_timeout,
            disconnect_notify_start,
            desync_detection,
            prediction,
            logger,
            sync_config,
            protocol_config,
            spectator_config,
            time_sync_config,
            event_queue_size,
        } = self;

        f.debug_struct("SessionBuilder")
            .field("game", game)
            .field("num_players", num_players)
            .field("max_prediction", max_prediction)
            .field("fps", fps)
            .field("input_delay", input_delay)
            .field("disconnect_timeout", disconnect_timeout)
            .field("disconnect_notify_start", disconnect_notify_start)
            .field("desync_detection", desync_detection)
            .field("prediction", prediction)
            .field("logger", logger)
            .field("sync_config", sync_config)
            .field("protocol_config", protocol_config)
            .field("spectator_config", spectator_config)
            .field("time_sync_config", time_sync_config)
            .field("event_queue_size", event_queue_size)
            .finish()
    }
}

impl SessionBuilder {
    /// A builder for the game `game` (name and version, handed to
    /// [`SessionCallbacks::begin_game`]) with every other value at its default.
    pub fn new(game: impl Into<String>) -> Self {
        Self {
            game: game.into(),
            num_players: DEFAULT_PLAYERS,
            max_prediction: MAX_PREDICTION_FRAMES,
            fps: DEFAULT_FPS,
            input_delay: DEFAULT_INPUT_DELAY,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            desync_detection: DesyncDetection::default(),
            prediction: Arc::new(RepeatLastConfirmed),
            logger: SessionLogger::global(),
            sync_config: SyncConfig::default(),
            protocol_config: ProtocolConfig::default(),
            spectator_config: SpectatorConfig::default(),
            time_sync_config: TimeSyncConfig::default(),
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
        }
    }

    /// Game identifier handed to the host on start.
    #[must_use]
    pub fn game(&self) -> &str {
        &self.game
    }

    /// Number of players, spectators excluded.
    #[must_use]
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// Change number of total players. Default is 2.
    ///
    /// # Errors
    /// Returns [`SessionError::PlayerOutOfRange`] outside `1..=MAX_PLAYERS`.
    pub fn with_num_players(mut self, num_players: usize) -> Result<Self, SessionError> {
        if num_players == 0 || num_players > MAX_PLAYERS {
            return Err(SessionError::PlayerOutOfRange {
                index: num_players,
                limit: MAX_PLAYERS + 1,
            });
        }
        self.num_players = num_players;
        Ok(self)
    }

    /// Change the maximum prediction window. Default is 8, which is also the largest
    /// allowed value.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidRequest`] outside `1..=MAX_PREDICTION_FRAMES`.
    pub fn with_max_prediction_window(mut self, window: usize) -> Result<Self, SessionError> {
        if window == 0 || window > MAX_PREDICTION_FRAMES {
            return Err(SessionError::invalid_request(format!(
                "prediction window must be within 1..={}, got {}",
                MAX_PREDICTION_FRAMES, window
            )));
        }
        self.max_prediction = window;
        Ok(self)
    }

    /// Frames local input is delayed by before it takes effect. Applies to every local
    /// player; [`P2PSession::set_frame_delay`] changes it per player later.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidRequest`] if `delay` does not fit the input ring.
    pub fn with_input_delay(mut self, delay: usize) -> Result<Self, SessionError> {
        if delay > MAX_FRAME_DELAY {
            return Err(SessionError::invalid_request(format!(
                "frame delay {} exceeds the maximum of {}",
                delay, MAX_FRAME_DELAY
            )));
        }
        self.input_delay = delay;
        Ok(self)
    }

    /// Sets the FPS this session is used with. This influences frame advantage
    /// estimates.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidRequest`] if the fps is 0.
    pub fn with_fps(mut self, fps: usize) -> Result<Self, SessionError> {
        if fps == 0 {
            return Err(SessionError::invalid_request("fps must be positive"));
        }
        self.fps = fps;
        Ok(self)
    }

    /// Silence after which a peer is disconnected. Default 2000 ms.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Silence after which [`Event::ConnectionInterrupted`](crate::Event::ConnectionInterrupted)
    /// is raised. Default 500 ms.
    pub fn with_disconnect_notify_start(mut self, notify_start: Duration) -> Self {
        self.disconnect_notify_start = notify_start;
        self
    }

    /// Whether peers exchange checksums of confirmed frames. Default off.
    pub fn with_desync_detection(mut self, desync_detection: DesyncDetection) -> Self {
        self.desync_detection = desync_detection;
        self
    }

    /// How missing remote input is guessed. Default [`RepeatLastConfirmed`].
    pub fn with_prediction_strategy(
        mut self,
        strategy: impl PredictionStrategy + 'static,
    ) -> Self {
        self.prediction = Arc::new(strategy);
        self
    }

    /// Where the session's log output goes. Default is the global subscriber.
    pub fn with_logger(mut self, logger: SessionLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Handshake and retransmission cadence.
    pub fn with_sync_config(mut self, sync_config: SyncConfig) -> Self {
        self.sync_config = sync_config;
        self
    }

    /// Quality reports, checksum history and protocol limits.
    pub fn with_protocol_config(mut self, protocol_config: ProtocolConfig) -> Self {
        self.protocol_config = protocol_config;
        self
    }

    /// Buffering of spectator sessions.
    pub fn with_spectator_config(mut self, spectator_config: SpectatorConfig) -> Self {
        self.spectator_config = spectator_config;
        self
    }

    /// Window of the frame advantage average.
    pub fn with_time_sync_config(mut self, time_sync_config: TimeSyncConfig) -> Self {
        self.time_sync_config = time_sync_config;
        self
    }

    /// Events kept for the host before the oldest are dropped. Default 100.
    ///
    /// # Errors
    /// Returns [`SessionError::InvalidRequest`] below 10.
    pub fn with_event_queue_size(mut self, size: usize) -> Result<Self, SessionError> {
        if size < 10 {
            return Err(SessionError::invalid_request(format!(
                "event queue size must be at least 10, got {}",
                size
            )));
        }
        self.event_queue_size = size;
        Ok(self)
    }

    /// Checks every nested configuration.
    ///
    /// # Errors
    /// Returns the first [`SessionError::InvalidRequest`] found.
    pub fn validate(&self) -> Result<(), SessionError> {
        self.sync_config.validate()?;
        self.protocol_config.validate()?;
        self.spectator_config.validate()?;
        self.time_sync_config.validate()?;
        if self.disconnect_notify_start > self.disconnect_timeout {
            return Err(SessionError::invalid_request(format!(
                "disconnect notify start {:?} is later than the disconnect timeout {:?}",
                self.disconnect_notify_start, self.disconnect_timeout
            )));
        }
        if let DesyncDetection::On { interval: 0 } = self.desync_detection {
            return Err(SessionError::invalid_request(
                "desync detection interval must be positive",
            ));
        }
        Ok(())
    }

    pub(crate) fn endpoint_settings(&self) -> EndpointSettings {
        EndpointSettings {
            num_players: self.num_players,
            max_prediction: self.max_prediction,
            fps: self.fps,
            disconnect_timeout: self.disconnect_timeout,
            disconnect_notify_start: self.disconnect_notify_start,
            desync_detection: self.desync_detection,
            sync_config: self.sync_config,
            protocol_config: self.protocol_config,
            time_sync_config: self.time_sync_config,
        }
    }

    /// Starts a peer-to-peer session on `socket`. Players are added afterwards.
    ///
    /// # Errors
    /// - [`SessionError::InvalidRequest`] if a configuration is invalid.
    /// - [`SessionError::GeneralFailure`] if [`SessionCallbacks::begin_game`] fails.
    pub fn start_p2p_session(
        self,
        callbacks: Box<dyn SessionCallbacks>,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<P2PSession, SessionError> {
        self.validate()?;
        P2PSession::new(self, callbacks, Box::new(socket))
    }

    /// Starts an offline determinism check that rolls back `check_distance` frames on
    /// every advance and compares the checksums of both runs.
    ///
    /// # Errors
    /// - [`SessionError::InvalidRequest`] unless `0 < check_distance < max_prediction`.
    /// - [`SessionError::GeneralFailure`] if [`SessionCallbacks::begin_game`] fails.
    pub fn start_synctest_session(
        self,
        callbacks: Box<dyn SessionCallbacks>,
        check_distance: usize,
    ) -> Result<SyncTestSession, SessionError> {
        if check_distance == 0 || check_distance >= self.max_prediction {
            return Err(SessionError::invalid_request(format!(
                "check distance must be within 1..{}, got {}",
                self.max_prediction, check_distance
            )));
        }
        self.validate()?;
        SyncTestSession::new(self, callbacks, check_distance)
    }

    /// Starts a session that watches the match hosted at `host`.
    ///
    /// # Errors
    /// - [`SessionError::InvalidRequest`] if a configuration is invalid.
    /// - [`SessionError::GeneralFailure`] if [`SessionCallbacks::begin_game`] fails.
    pub fn start_spectator_session(
        self,
        callbacks: Box<dyn SessionCallbacks>,
        host: PeerAddress,
        socket: impl NonBlockingSocket + 'static,
    ) -> Result<SpectatorSession, SessionError> {
        self.validate()?;
        SpectatorSession::new(self, callbacks, host, Box::new(socket))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::input_queue::BlankPrediction;
    use crate::ErrorCode;

    #[test]
    fn defaults() {
        let builder = SessionBuilder::new("game");
        assert_eq!(builder.game(), "game");
        assert_eq!(builder.num_players, 2);
        assert_eq!(builder.max_prediction, MAX_PREDICTION_FRAMES);
        assert_eq!(builder.disconnect_timeout, Duration::from_millis(2000));
        assert_eq!(builder.disconnect_notify_start, Duration::from_millis(500));
        assert_eq!(builder.desync_detection, DesyncDetection::Off);
        assert_eq!(builder.event_queue_size, 100);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn player_count_bounds() {
        assert!(SessionBuilder::new("g").with_num_players(1).is_ok());
        assert!(SessionBuilder::new("g").with_num_players(4).is_ok());
        let err = SessionBuilder::new("g").with_num_players(5).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PlayerOutOfRange);
        assert!(SessionBuilder::new("g").with_num_players(0).is_err());
    }

    #[test]
    fn prediction_window_bounds() {
        assert!(SessionBuilder::new("g").with_max_prediction_window(0).is_err());
        assert!(SessionBuilder::new("g").with_max_prediction_window(9).is_err());
        let builder = SessionBuilder::new("g").with_max_prediction_window(4).unwrap();
        assert_eq!(builder.max_prediction, 4);
    }

    #[test]
    fn input_delay_and_fps() {
        assert!(SessionBuilder::new("g").with_input_delay(MAX_FRAME_DELAY).is_ok());
        assert!(SessionBuilder::new("g").with_input_delay(MAX_FRAME_DELAY + 1).is_err());
        assert!(SessionBuilder::new("g").with_fps(0).is_err());
        assert!(SessionBuilder::new("g").with_event_queue_size(9).is_err());
    }

    #[test]
    fn notify_after_timeout_is_rejected() {
        let builder = SessionBuilder::new("g")
            .with_disconnect_timeout(Duration::from_millis(100))
            .with_disconnect_notify_start(Duration::from_millis(200));
        assert_eq!(builder.validate().unwrap_err().code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn zero_desync_interval_is_rejected() {
        let builder =
            SessionBuilder::new("g").with_desync_detection(DesyncDetection::On { interval: 0 });
        assert!(builder.validate().is_err());
    }

    #[test]
    fn endpoint_settings_mirror_builder() {
        let builder = SessionBuilder::new("g")
            .with_num_players(3)
            .unwrap()
            .with_fps(30)
            .unwrap()
            .with_prediction_strategy(BlankPrediction);
        let settings = builder.endpoint_settings();
        assert_eq!(settings.num_players, 3);
        assert_eq!(settings.fps, 30);
        assert_eq!(settings.max_prediction, MAX_PREDICTION_FRAMES);
        assert!(format!("{:?}", builder).contains("BlankPrediction"));
    }
}
