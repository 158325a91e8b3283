//! Tysiacha Peer Demo
//!
//! Three peers share an in-memory bus, find each other, and play a game of
//! Тысяча by a simple greedy strategy. Set `RUST_LOG=tysiacha=debug` to
//! watch the replication traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tysiacha::{
    Action, Coordinator, CoordinatorHandle, GameState, PeerConfig, PeerContext, RoomCode, SessionId, VERSION,
    game::dice,
    network::InMemoryBus,
    replication::MemoryStore,
};

/// Stop the demo after this many turns even without a winner.
const MAX_TURNS: usize = 60;

/// Bank once the turn is worth this much.
const BANK_AT: i32 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Tysiacha peer demo v{}", VERSION);

    let bus = Arc::new(InMemoryBus::new());
    let room = RoomCode::generate();
    let config = PeerConfig {
        discovery_window: Duration::from_millis(500),
        ..PeerConfig::default()
    };
    info!("Room code: {}", room);

    let mut peers: Vec<CoordinatorHandle> = Vec::new();
    for name in ["Anna", "Boris", "Clara"] {
        let context = PeerContext {
            identity: SessionId::generate(),
            player_name: name.to_string(),
            room: room.clone(),
            as_spectator: false,
        };
        peers.push(Coordinator::spawn(Arc::clone(&bus), Arc::new(MemoryStore::new()), context, config.clone()));

        // The first peer must be hosting before the others arrive.
        let seated = peers.len();
        wait_for(&peers[0], |s| s.claimed_count() == seated).await?;
    }
    for peer in &peers {
        wait_for(peer, |s| s.claimed_count() == peers.len()).await?;
    }

    let host = &peers[0];
    host.dispatch(Action::StartGame).await?;
    let state = wait_for(host, |s| s.is_game_started).await?;
    info!("{}", state.game_message);

    for _ in 0..MAX_TURNS {
        let state = current(host)?;
        if state.is_game_over {
            break;
        }
        let slot = state.current_player_index;
        let Some(actor) = peers.iter().find(|p| state.slot_of(p.identity()) == Some(slot)) else {
            bail!("no peer owns slot {}", slot);
        };
        play_turn(host, actor).await?;
    }

    let final_state = current(host)?;
    info!("Final message: {}", final_state.game_message);
    for player in final_state.players.iter().filter(|p| p.is_claimed) {
        info!("{:>6}: {:>5} ({} rounds)", player.name, player.total_score(), player.scores.len());
    }
    info!("Fingerprint: {}", final_state.fingerprint());

    let mut peers = peers.into_iter();
    if let Some(first) = peers.next() {
        first.leave().await?;
    }
    for peer in peers {
        peer.shutdown().await?;
    }
    Ok(())
}

/// Roll, keep scoring dice, and bank greedily until the turn ends.
async fn play_turn(host: &CoordinatorHandle, actor: &CoordinatorHandle) -> Result<()> {
    let slot = current(host)?.current_player_index;

    loop {
        let mut state = act(host, actor, Action::RollDice).await?;
        info!("{}", state.game_message);
        if state.current_player_index != slot || state.is_game_over {
            return Ok(());
        }

        let picks = scoring_indices(&state.dice_on_board);
        for &index in &picks {
            state = act(host, actor, Action::ToggleSelection { index }).await?;
        }

        let worth = state.current_turn_score + state.potential_score;
        let remaining = state.dice_on_board.len() - picks.len();
        if worth >= BANK_AT || (1..=2).contains(&remaining) {
            let state = act(host, actor, Action::BankScore).await?;
            info!("{}", state.game_message);
            return Ok(());
        }
        act(host, actor, Action::KeepDice).await?;
    }
}

/// Every one, every five, and every die of a face showing three or more times.
fn scoring_indices(board: &[u8]) -> Vec<usize> {
    let count = |face: u8| board.iter().filter(|&&d| d == face).count();
    let picks: Vec<usize> = board
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 1 || d == 5 || count(d) >= 3)
        .map(|(i, _)| i)
        .collect();

    let chosen: Vec<u8> = picks.iter().map(|&i| board[i]).collect();
    debug_assert!(dice::validate(&chosen).is_valid);
    picks
}

/// Dispatch through `actor`, wait for the host to publish the result and
/// for `actor` to catch up with it.
async fn act(host: &CoordinatorHandle, actor: &CoordinatorHandle, action: Action) -> Result<GameState> {
    let before = current(host)?.version;
    actor.dispatch(action).await?;
    let state = wait_for(host, |s| s.version > before).await?;
    wait_for(actor, |s| s.version >= state.version).await?;
    Ok(state)
}

fn current(peer: &CoordinatorHandle) -> Result<GameState> {
    peer.get_state().context("peer has no state yet")
}

async fn wait_for<F>(peer: &CoordinatorHandle, predicate: F) -> Result<GameState>
where
    F: Fn(&GameState) -> bool,
{
    let mut rx = peer.subscribe();
    let guard = timeout(Duration::from_secs(10), rx.wait_for(|s| s.as_ref().is_some_and(&predicate)))
        .await
        .context("timed out waiting for the room")?
        .context("peer stopped")?;
    let state = guard.as_ref().cloned();
    state.context("peer has no state yet")
}
