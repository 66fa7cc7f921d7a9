//! Session controller: one player, at most one room.
//!
//! Every mutating intent computes the next `RoomState` with the pure
//! transitions in `tavern_core::store`, adopts it locally right away and
//! publishes the whole document. Nothing is rolled back when the publish
//! fails; the divergence is visible through [`SyncStatus`] until the next
//! snapshot arrives and replaces the local state.
//!
//! Snapshots always win. Local state is never merged with a remote one.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::collections::VecDeque;
use std::time::Duration;

use tavern_core::dice::{self, RollHistory, RollMode, RollResult, HISTORY_CAP};
use tavern_core::input::{self, TokenEdit};
use tavern_core::model::{now_millis, DEFAULT_TOKEN_COLOR};
use tavern_core::store::{self, Direction, LootPatch, NewLootItem};
use tavern_core::{
    Character, CurrencyCode, GridPos, PlayerDocument, PlayerName, RoomCode, RoomState, Settings,
    ValidationError,
};

use crate::channel::{ChannelEvent, ReplicationChannel, Subscription, SyncError};
use crate::protocol::{DocumentKey, PeerInfo};

/// Alerts kept for the UI before the oldest are dropped.
const ALERT_CAP: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a join or player lookup may take
    pub join_timeout: Duration,
    /// Dice history length
    pub history_cap: usize,
    /// Color for tokens placed without an explicit one
    pub default_color: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            history_cap: HISTORY_CAP,
            default_color: DEFAULT_TOKEN_COLOR.to_string(),
        }
    }
}

/// Whether the local room mirror matches the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not in a room
    Idle,
    /// A local change is published but its snapshot has not come back
    Pending { clock: u64 },
    /// Local state is the snapshot at `version`
    Synced { version: u64 },
    /// The last publish failed or was rejected; local state is ahead of the hub
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("not in a room")]
    NotJoined,
    #[error("set a player name first")]
    NoPlayerName,
    #[error("malformed document: {0}")]
    Document(String),
}

impl From<SyncError> for SessionError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Publish(_) | SyncError::Rejected { .. } => SessionError::Publish(e.to_string()),
            other => SessionError::Connection(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Validation,
    Connection,
    Publish,
}

/// User-visible, non-fatal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl From<&SessionError> for Alert {
    fn from(e: &SessionError) -> Self {
        let kind = match e {
            SessionError::Validation(_) | SessionError::NotJoined | SessionError::NoPlayerName => {
                AlertKind::Validation
            }
            SessionError::Publish(_) => AlertKind::Publish,
            SessionError::Connection(_) | SessionError::Document(_) => AlertKind::Connection,
        };
        Alert {
            kind,
            message: e.to_string(),
        }
    }
}

/// Everything the presentation layer can ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    CellTapped { pos: GridPos, color: Option<String> },
    TokenEdited { position: String, edit: TokenEdit },
    EffectToggled { position: String, effect: String },
    TokenDeleted { position: String },
    RollInitiative,
    NextTurn,
    PreviousTurn,
    EndCombat,
    LootItemAdded { name: String, quantity: String },
    LootItemRemoved { id: String },
    CurrencyChanged { code: CurrencyCode, delta: i64 },
    LootViewerChanged(Option<String>),
    LayerToggled(String),
    SettingsChanged(Settings),
    CharacterSaved(Character),
    DiceRolled {
        sides: u32,
        quantity: String,
        mode: RollMode,
        modifier: String,
    },
}

#[derive(Clone, Copy)]
enum Source {
    Room,
    Player,
}

/// Room-scoped state; dropped as a whole on leave.
struct ActiveRoom {
    code: RoomCode,
    doc: DocumentKey,
    state: RoomState,
    version: u64,
    subscription: Subscription,
    peers: Vec<PeerInfo>,
}

pub struct Session<C: ReplicationChannel> {
    channel: C,
    config: SessionConfig,
    player: Option<PlayerName>,
    /// Character sheets from the player document
    characters: Vec<Character>,
    /// Held while a player is set so remote saves and rejections arrive
    player_doc: Option<Subscription>,
    room: Option<ActiveRoom>,
    status: SyncStatus,
    history: RollHistory,
    rng: Pcg64Mcg,
    alerts: VecDeque<Alert>,
}

impl<C: ReplicationChannel> Session<C> {
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, SessionConfig::default())
    }

    pub fn with_config(channel: C, config: SessionConfig) -> Self {
        Self::with_rng(channel, config, Pcg64Mcg::from_entropy())
    }

    /// Deterministic dice and initiative.
    pub fn with_seed(channel: C, config: SessionConfig, seed: u64) -> Self {
        Self::with_rng(channel, config, Pcg64Mcg::seed_from_u64(seed))
    }

    fn with_rng(channel: C, config: SessionConfig, rng: Pcg64Mcg) -> Self {
        Self {
            channel,
            history: RollHistory::new(config.history_cap),
            config,
            player: None,
            characters: Vec::new(),
            player_doc: None,
            room: None,
            status: SyncStatus::Idle,
            rng,
            alerts: VecDeque::new(),
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn player_name(&self) -> Option<&PlayerName> {
        self.player.as_ref()
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.room.as_ref().map(|r| &r.code)
    }

    pub fn is_joined(&self) -> bool {
        self.room.is_some()
    }

    /// Local mirror of the room document.
    pub fn state(&self) -> Option<&RoomState> {
        self.room.as_ref().map(|r| &r.state)
    }

    /// Version of the last snapshot adopted.
    pub fn version(&self) -> Option<u64> {
        self.room.as_ref().map(|r| r.version)
    }

    pub fn peers(&self) -> &[PeerInfo] {
        self.room.as_ref().map_or(&[], |r| r.peers.as_slice())
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    pub fn history(&self) -> &RollHistory {
        &self.history
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    pub fn take_alerts(&mut self) -> Vec<Alert> {
        self.alerts.drain(..).collect()
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    // ─── Identity and lifecycle ───────────────────────────────────────

    /// Set the local player and load their character sheets.
    ///
    /// The player document stays subscribed until another player is set.
    pub async fn set_player_name(&mut self, raw: &str) -> Result<(), SessionError> {
        let name = PlayerName::parse(raw)?;
        let key = DocumentKey::player(&name);
        self.channel.set_display_name(name.as_str());

        // Subscribing again replaces a live subscription to the same key
        if self.player_doc.as_ref().is_some_and(|sub| sub.doc() == &key) {
            self.player_doc = None;
        }
        let sub = self.subscribe(&key).await?;
        let doc = match sub.initial().decode::<PlayerDocument>() {
            Ok(doc) => doc,
            Err(e) => {
                drop(sub);
                self.release(&key).await;
                return Err(SessionError::Document(e.to_string()));
            }
        };

        if let Some(previous) = self.player_doc.take() {
            let previous_key = previous.doc().clone();
            drop(previous);
            self.release(&previous_key).await;
        }
        log::info!("Player {name} loaded with {} characters", doc.characters.len());
        self.characters = doc.characters;
        self.player_doc = Some(sub);
        self.player = Some(name);
        Ok(())
    }

    /// Join a room, leaving the current one first.
    pub async fn join(&mut self, raw_code: &str) -> Result<(), SessionError> {
        if self.player.is_none() {
            return Err(SessionError::NoPlayerName);
        }
        let code = RoomCode::parse(raw_code)?;
        if self.room.is_some() {
            self.leave().await;
        }

        let doc = DocumentKey::room(&code);
        let subscription = self.subscribe(&doc).await?;
        let state = match subscription.initial().decode::<RoomState>() {
            Ok(state) => state,
            Err(e) => {
                drop(subscription);
                self.release(&doc).await;
                return Err(SessionError::Document(e.to_string()));
            }
        };

        let version = subscription.initial().version;
        let peers = subscription.peers().to_vec();
        log::info!("Joined room {code} at v{version} with {} other peers", peers.len());
        self.room = Some(ActiveRoom {
            code,
            doc,
            state,
            version,
            subscription,
            peers,
        });
        self.status = SyncStatus::Synced { version };
        Ok(())
    }

    /// Leave the room. Player identity, characters and dice history stay.
    pub async fn leave(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        drop(room.subscription);
        self.release(&room.doc).await;
        self.status = SyncStatus::Idle;
        log::info!("Left room {}", room.code);
    }

    async fn release(&mut self, doc: &DocumentKey) {
        if let Err(e) = self.channel.unsubscribe(doc).await {
            log::warn!("Releasing {doc}: {e}");
        }
    }

    async fn subscribe(&mut self, doc: &DocumentKey) -> Result<Subscription, SessionError> {
        match tokio::time::timeout(self.config.join_timeout, self.channel.subscribe(doc)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::Connection(format!("timed out subscribing to {doc}"))),
        }
    }

    // ─── Mutation pipeline ────────────────────────────────────────────

    /// Compute, adopt and publish the next room state. Returns the publish clock.
    async fn apply<F>(&mut self, transition: F) -> Result<u64, SessionError>
    where
        F: FnOnce(&RoomState, &mut Pcg64Mcg) -> Result<RoomState, ValidationError>,
    {
        let room = self.room.as_mut().ok_or(SessionError::NotJoined)?;
        let mut next = transition(&room.state, &mut self.rng)?;
        next.last_update = now_millis();
        let payload = serde_json::to_vec(&next).map_err(|e| SessionError::Document(e.to_string()))?;

        // Optimistic: shown before the hub has it
        room.state = next;
        match self.channel.publish(&room.doc, payload, None).await {
            Ok(clock) => {
                self.status = SyncStatus::Pending { clock };
                Ok(clock)
            }
            Err(e) => {
                log::warn!("Publish to {} failed: {e}", room.doc);
                self.status = SyncStatus::Failed(e.to_string());
                Err(e.into())
            }
        }
    }

    fn acting_player(&self) -> Result<String, SessionError> {
        self.player
            .as_ref()
            .map(|p| p.as_str().to_string())
            .ok_or(SessionError::NoPlayerName)
    }

    // ─── Intents ──────────────────────────────────────────────────────

    pub async fn toggle_token(&mut self, pos: GridPos, color: Option<&str>) -> Result<u64, SessionError> {
        let color = color.unwrap_or(&self.config.default_color).to_string();
        self.apply(|s, _| Ok(store::toggle_token(s, pos, &color))).await
    }

    /// Apply the token edit form. Numbers are parsed leniently and clamped.
    pub async fn edit_token(&mut self, position: &str, edit: &TokenEdit) -> Result<u64, SessionError> {
        let patch = edit.to_patch();
        self.apply(|s, _| store::update_token(s, position, &patch)).await
    }

    pub async fn toggle_effect(&mut self, position: &str, effect: &str) -> Result<u64, SessionError> {
        self.apply(|s, _| store::toggle_effect(s, position, effect)).await
    }

    pub async fn delete_token(&mut self, position: &str) -> Result<u64, SessionError> {
        self.apply(|s, _| store::delete_token(s, position)).await
    }

    pub async fn roll_initiative(&mut self) -> Result<u64, SessionError> {
        self.apply(|s, rng| store::roll_initiative(s, rng)).await
    }

    pub async fn next_turn(&mut self) -> Result<u64, SessionError> {
        self.apply(|s, _| store::advance_turn(s, Direction::Forward)).await
    }

    pub async fn previous_turn(&mut self) -> Result<u64, SessionError> {
        self.apply(|s, _| store::advance_turn(s, Direction::Back)).await
    }

    pub async fn end_combat(&mut self) -> Result<u64, SessionError> {
        self.apply(|s, _| Ok(store::end_combat(s))).await
    }

    pub async fn add_loot_item(&mut self, name: &str, quantity: &str) -> Result<u64, SessionError> {
        let item = NewLootItem {
            name: name.to_string(),
            quantity: input::quantity(quantity),
            added_by: self.acting_player()?,
        };
        self.apply(|s, _| store::add_loot_item(s, item)).await
    }

    pub async fn remove_loot_item(&mut self, id: &str) -> Result<u64, SessionError> {
        self.apply(|s, _| store::remove_loot_item(s, id)).await
    }

    pub async fn adjust_currency(&mut self, code: CurrencyCode, delta: i64) -> Result<u64, SessionError> {
        self.apply(|s, _| Ok(store::adjust_currency(s, code, delta))).await
    }

    pub async fn set_loot_viewer(&mut self, viewer: Option<String>) -> Result<u64, SessionError> {
        let patch = LootPatch {
            current_viewer: Some(viewer),
            ..LootPatch::default()
        };
        self.apply(|s, _| Ok(store::update_loot(s, &patch))).await
    }

    pub async fn toggle_layer(&mut self, layer: &str) -> Result<u64, SessionError> {
        self.apply(|s, _| Ok(store::toggle_layer(s, layer))).await
    }

    pub async fn update_settings(&mut self, settings: &Settings) -> Result<u64, SessionError> {
        self.apply(|s, _| Ok(store::update_settings(s, settings))).await
    }

    /// Save a sheet to the player document and, when in a room, to the room.
    pub async fn save_character(&mut self, character: &Character) -> Result<(), SessionError> {
        let player = self.player.clone().ok_or(SessionError::NoPlayerName)?;
        let mut owned = character.clone();
        owned.owner = player.as_str().to_string();

        let current = PlayerDocument {
            characters: self.characters.clone(),
            last_update: 0,
        };
        let mut next = store::upsert_player_character(&current, &owned)?;
        next.last_update = now_millis();
        let payload = serde_json::to_vec(&next).map_err(|e| SessionError::Document(e.to_string()))?;

        // Local sheets are not room-scoped and survive a failed write
        self.characters = next.characters;
        self.channel
            .publish(&DocumentKey::player(&player), payload, None)
            .await?;

        if self.room.is_some() {
            let acting = player.as_str().to_string();
            self.apply(|s, _| store::upsert_character(s, &acting, &owned)).await?;
        }
        Ok(())
    }

    /// Roll locally and record it in the history. Not replicated.
    pub fn roll_dice(
        &mut self,
        sides: u32,
        quantity: &str,
        mode: RollMode,
        modifier: &str,
    ) -> Result<RollResult, SessionError> {
        let result = dice::roll(
            &mut self.rng,
            sides,
            input::quantity(quantity),
            mode,
            input::modifier(modifier),
        )?;
        log::debug!("Rolled {} = {}", result.describe(), result.total);
        self.history.push(result.clone());
        Ok(result)
    }

    /// Run an intent, turning any failure into an alert. Returns success.
    pub async fn dispatch(&mut self, intent: Intent) -> bool {
        let result = match intent {
            Intent::CellTapped { pos, color } => self.toggle_token(pos, color.as_deref()).await.map(drop),
            Intent::TokenEdited { position, edit } => self.edit_token(&position, &edit).await.map(drop),
            Intent::EffectToggled { position, effect } => {
                self.toggle_effect(&position, &effect).await.map(drop)
            }
            Intent::TokenDeleted { position } => self.delete_token(&position).await.map(drop),
            Intent::RollInitiative => self.roll_initiative().await.map(drop),
            Intent::NextTurn => self.next_turn().await.map(drop),
            Intent::PreviousTurn => self.previous_turn().await.map(drop),
            Intent::EndCombat => self.end_combat().await.map(drop),
            Intent::LootItemAdded { name, quantity } => self.add_loot_item(&name, &quantity).await.map(drop),
            Intent::LootItemRemoved { id } => self.remove_loot_item(&id).await.map(drop),
            Intent::CurrencyChanged { code, delta } => self.adjust_currency(code, delta).await.map(drop),
            Intent::LootViewerChanged(viewer) => self.set_loot_viewer(viewer).await.map(drop),
            Intent::LayerToggled(layer) => self.toggle_layer(&layer).await.map(drop),
            Intent::SettingsChanged(settings) => self.update_settings(&settings).await.map(drop),
            Intent::CharacterSaved(character) => self.save_character(&character).await,
            Intent::DiceRolled {
                sides,
                quantity,
                mode,
                modifier,
            } => self.roll_dice(sides, &quantity, mode, &modifier).map(drop),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                self.raise(&e);
                false
            }
        }
    }

    fn raise(&mut self, error: &SessionError) {
        log::warn!("{error}");
        if self.alerts.len() == ALERT_CAP {
            self.alerts.pop_front();
        }
        self.alerts.push_back(Alert::from(error));
    }

    // ─── Remote events ────────────────────────────────────────────────

    /// Wait for the next event on the room or player subscription and apply it.
    ///
    /// Returns `false` when nothing is subscribed or the room subscription
    /// has ended.
    pub async fn next_remote(&mut self) -> bool {
        let (source, event) = match (self.room.as_mut(), self.player_doc.as_mut()) {
            (None, None) => return false,
            (Some(room), None) => (Source::Room, room.subscription.next_event().await),
            (None, Some(player)) => (Source::Player, player.next_event().await),
            (Some(room), Some(player)) => tokio::select! {
                event = room.subscription.next_event() => (Source::Room, event),
                event = player.next_event() => (Source::Player, event),
            },
        };
        match (source, event) {
            (Source::Room, Some(event)) => {
                self.handle_event(event);
                true
            }
            (Source::Room, None) => false,
            (Source::Player, Some(event)) => {
                self.handle_player_event(event);
                true
            }
            (Source::Player, None) => {
                self.player_doc = None;
                self.room.is_some()
            }
        }
    }

    /// Apply every event already buffered. Returns how many were applied.
    pub fn drain_remote(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.player_doc.as_mut().and_then(Subscription::try_next_event) {
            self.handle_player_event(event);
            applied += 1;
        }
        while let Some(event) = self.room.as_mut().and_then(|r| r.subscription.try_next_event()) {
            self.handle_event(event);
            applied += 1;
        }
        applied
    }

    fn handle_player_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Snapshot(snapshot) => match snapshot.decode::<PlayerDocument>() {
                Ok(doc) => self.characters = doc.characters,
                Err(e) => self.raise(&SessionError::Document(e.to_string())),
            },
            ChannelEvent::Rejected { clock, reason } => {
                log::warn!("Character save {clock} rejected: {reason}");
                self.raise(&SessionError::Publish(reason));
            }
            ChannelEvent::Closed => {
                self.player_doc = None;
                self.raise(&SessionError::Connection("player subscription closed".into()));
            }
            ChannelEvent::PeerJoined(_) | ChannelEvent::PeerLeft(_) => {}
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        let own_id = self.channel.peer_info().peer_id;
        let Some(room) = self.room.as_mut() else {
            return;
        };

        match event {
            ChannelEvent::Snapshot(snapshot) => {
                if snapshot.doc != room.doc {
                    return;
                }
                match snapshot.decode::<RoomState>() {
                    Ok(state) => {
                        // Replace, never merge
                        room.state = state;
                        room.version = snapshot.version;
                        self.status = match self.status {
                            SyncStatus::Pending { clock }
                                if snapshot.author != own_id || snapshot.clock < clock =>
                            {
                                SyncStatus::Pending { clock }
                            }
                            _ => SyncStatus::Synced {
                                version: snapshot.version,
                            },
                        };
                    }
                    Err(e) => {
                        let error = SessionError::Document(e.to_string());
                        self.raise(&error);
                    }
                }
            }
            ChannelEvent::Rejected { clock, reason } => {
                log::warn!("Publish {clock} to {} rejected: {reason}", room.doc);
                // A newer publish may still land
                self.status = match self.status {
                    SyncStatus::Pending { clock: pending } if pending > clock => {
                        SyncStatus::Pending { clock: pending }
                    }
                    _ => SyncStatus::Failed(reason.clone()),
                };
                self.raise(&SessionError::Publish(reason));
            }
            ChannelEvent::PeerJoined(info) => {
                if !room.peers.iter().any(|p| p.peer_id == info.peer_id) {
                    log::info!("{} joined {}", info.name, room.code);
                    room.peers.push(info);
                }
            }
            ChannelEvent::PeerLeft(peer_id) => {
                room.peers.retain(|p| p.peer_id != peer_id);
            }
            ChannelEvent::Closed => {
                self.status = SyncStatus::Failed("connection closed".into());
                self.raise(&SessionError::Connection("room subscription closed".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use crate::hub::DocumentHub;
    use std::sync::Arc;

    async fn joined_session(hub: &Arc<DocumentHub>, name: &str, room: &str) -> Session<LocalChannel> {
        let channel = LocalChannel::new(hub.clone(), PeerInfo::new("Anonymous"));
        let mut session = Session::with_seed(channel, SessionConfig::default(), 7);
        session.set_player_name(name).await.unwrap();
        session.join(room).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_join_requires_player_name() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = Session::new(LocalChannel::new(hub, PeerInfo::new("Anonymous")));
        assert!(matches!(session.join("abcd").await, Err(SessionError::NoPlayerName)));
        assert_eq!(session.status(), &SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_empty_room_code_rejected() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = Session::new(LocalChannel::new(hub, PeerInfo::new("Anonymous")));
        session.set_player_name("Mira").await.unwrap();
        assert!(matches!(
            session.join("   ").await,
            Err(SessionError::Validation(ValidationError::EmptyRoomCode))
        ));
    }

    #[tokio::test]
    async fn test_player_name_sets_display_name() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = Session::new(LocalChannel::new(hub, PeerInfo::new("Anonymous")));
        session.set_player_name("  Mira ").await.unwrap();
        assert_eq!(session.player_name().unwrap().as_str(), "Mira");
        assert_eq!(session.channel().peer_info().name, "Mira");
    }

    #[tokio::test]
    async fn test_pending_until_own_echo() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = joined_session(&hub, "Mira", "abcd").await;
        assert_eq!(session.status(), &SyncStatus::Synced { version: 1 });

        let clock = session.toggle_token(GridPos::new(0, 0), None).await.unwrap();
        assert_eq!(session.status(), &SyncStatus::Pending { clock });

        assert!(session.next_remote().await);
        assert_eq!(session.status(), &SyncStatus::Synced { version: 2 });
        assert_eq!(session.version(), Some(2));
    }

    #[tokio::test]
    async fn test_stale_echo_keeps_pending() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = joined_session(&hub, "Mira", "abcd").await;

        session.toggle_token(GridPos::new(0, 0), None).await.unwrap();
        let second = session.toggle_token(GridPos::new(0, 1), None).await.unwrap();

        assert!(session.next_remote().await);
        assert_eq!(session.status(), &SyncStatus::Pending { clock: second });
        assert!(session.next_remote().await);
        assert_eq!(session.status(), &SyncStatus::Synced { version: 3 });
        assert_eq!(session.state().unwrap().tokens.len(), 2);
    }

    #[tokio::test]
    async fn test_older_rejection_keeps_newer_pending() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = joined_session(&hub, "Mira", "abcd").await;
        session.status = SyncStatus::Pending { clock: 5 };

        session.handle_event(ChannelEvent::Rejected {
            clock: 3,
            reason: "version conflict".into(),
        });
        assert_eq!(session.status(), &SyncStatus::Pending { clock: 5 });

        session.handle_event(ChannelEvent::Rejected {
            clock: 5,
            reason: "version conflict".into(),
        });
        assert_eq!(session.status(), &SyncStatus::Failed("version conflict".into()));

        let alerts = session.take_alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::Publish));
    }

    #[tokio::test]
    async fn test_player_document_held_until_switch() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mira = DocumentKey::player(&PlayerName::parse("Mira").unwrap());
        let theo = DocumentKey::player(&PlayerName::parse("Theo").unwrap());
        let mut session = Session::new(LocalChannel::new(hub.clone(), PeerInfo::new("Anonymous")));

        session.set_player_name("Mira").await.unwrap();
        assert_eq!(hub.peers(&mira).await.len(), 1);
        session.set_player_name("Mira").await.unwrap();
        assert_eq!(hub.peers(&mira).await.len(), 1);

        session.set_player_name("Theo").await.unwrap();
        assert!(hub.peers(&mira).await.is_empty());
        assert_eq!(hub.peers(&theo).await.len(), 1);
        assert!(!session.channel().is_subscribed(&mira));
    }

    #[tokio::test]
    async fn test_remote_character_save_reaches_other_session() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut desk = Session::new(LocalChannel::new(hub.clone(), PeerInfo::new("Anonymous")));
        let mut phone = Session::new(LocalChannel::new(hub.clone(), PeerInfo::new("Anonymous")));
        desk.set_player_name("Mira").await.unwrap();
        phone.set_player_name("Mira").await.unwrap();

        desk.save_character(&Character::new("Vex")).await.unwrap();
        while phone.characters().is_empty() {
            assert!(phone.next_remote().await);
        }
        assert_eq!(phone.characters()[0].name, "Vex");
        assert_eq!(phone.characters()[0].owner, "Mira");
        assert!(!phone.is_joined());
    }

    #[tokio::test]
    async fn test_validation_error_leaves_state_and_status() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = joined_session(&hub, "Mira", "abcd").await;

        assert!(!session.dispatch(Intent::RollInitiative).await);
        assert!(!session.dispatch(Intent::NextTurn).await);
        assert_eq!(session.status(), &SyncStatus::Synced { version: 1 });
        assert_eq!(hub.version(&DocumentKey::room(&RoomCode::parse("abcd").unwrap())).await, Some(1));

        let alerts = session.take_alerts();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::Validation));
    }

    #[tokio::test]
    async fn test_intent_without_room() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = Session::new(LocalChannel::new(hub, PeerInfo::new("Anonymous")));
        assert!(matches!(session.end_combat().await, Err(SessionError::NotJoined)));
    }

    #[tokio::test]
    async fn test_dice_history_is_local() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut session = joined_session(&hub, "Mira", "abcd").await;

        let result = session.roll_dice(20, "2", RollMode::Advantage, "+3").unwrap();
        assert_eq!(result.kept_values.len(), 2);
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.drain_remote(), 0);
        assert_eq!(session.version(), Some(1));

        assert!(session
            .dispatch(Intent::DiceRolled {
                sides: 6,
                quantity: "abc".into(),
                mode: RollMode::Normal,
                modifier: "".into(),
            })
            .await);
        assert_eq!(session.history().latest().unwrap().label, "1d6");
        assert!(!session
            .dispatch(Intent::DiceRolled {
                sides: 0,
                quantity: "1".into(),
                mode: RollMode::Normal,
                modifier: "0".into(),
            })
            .await);
    }

    #[tokio::test]
    async fn test_roster_tracks_peers() {
        let hub = Arc::new(DocumentHub::in_memory());
        let mut mira = joined_session(&hub, "Mira", "abcd").await;
        let mut theo = joined_session(&hub, "Theo", "abcd").await;
        assert_eq!(theo.peers().len(), 1);
        assert_eq!(theo.peers()[0].name, "Mira");

        assert!(mira.next_remote().await);
        assert_eq!(mira.peers().len(), 1);
        assert_eq!(mira.peers()[0].name, "Theo");

        theo.leave().await;
        assert!(mira.next_remote().await);
        assert!(mira.peers().is_empty());
    }
}
