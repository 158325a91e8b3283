//! Rules Engine
//!
//! `apply(state, action, origin) -> state'`. Pure and deterministic: dice
//! come from the RNG stored in the state, time comes from the origin.
//!
//! Nothing here fails. An action that does not fit the current state
//! returns the state unchanged, or with only the status message updated
//! when the player should be told why.

use crate::game::action::{Action, Origin};
use crate::game::dice;
use crate::game::state::{
    Barrel, GameState, JoinRequest, Player, PlayerStatus, ScoreEntry, SessionId, Spectator,
};
use crate::{ENTRY_THRESHOLD, WINNING_SCORE};

/// Apply an action, returning the next state.
pub fn apply(state: &GameState, action: &Action, origin: &Origin) -> GameState {
    let mut next = state.clone();
    apply_mut(&mut next, action, origin);
    next
}

/// Apply an action in place.
pub fn apply_mut(state: &mut GameState, action: &Action, origin: &Origin) {
    if action.is_host_only() && !state.is_host(&origin.sender) {
        return;
    }
    if action.is_turn_action() && !is_turn_of(state, &origin.sender) {
        return;
    }

    let now = origin.at_ms;

    match action {
        Action::RollDice => roll_dice(state, now),
        Action::ToggleSelection { index } => toggle_selection(state, *index),
        Action::KeepDice => keep_dice(state),
        Action::BankScore => bank_score(state, now),
        Action::StartGame => start_game(state, now),
        Action::NewGame => new_game(state, now),
        Action::SkipTurn => skip_turn(state, &origin.sender, now),
        Action::PlayerJoin { name, session_id, as_spectator } => {
            if session_id == &origin.sender {
                player_join(state, name, session_id, *as_spectator, now);
            }
        }
        Action::PlayerLeave { session_id } => {
            if session_id == &origin.sender {
                player_leave(state, session_id, now);
            }
        }
        Action::KickPlayer { slot } => kick_player(state, *slot, now),
        Action::ResolveJoinRequest { session_id, accepted } => {
            resolve_join_request(state, session_id, *accepted, now);
        }
        Action::PresenceHeartbeat { session_id } => {
            if session_id == &origin.sender {
                heartbeat(state, session_id, now);
            }
        }
    }
}

fn in_progress(state: &GameState) -> bool {
    state.is_game_started && !state.is_game_over
}

fn is_turn_of(state: &GameState, session: &SessionId) -> bool {
    in_progress(state)
        && state
            .current_player()
            .is_some_and(|p| p.owned_by(session))
}

fn current_name(state: &GameState) -> String {
    state
        .current_player()
        .map(|p| p.name.clone())
        .unwrap_or_default()
}

// =============================================================================
// DICE
// =============================================================================

fn roll_dice(state: &mut GameState, now: u64) {
    if !state.can_roll {
        return;
    }

    let hot_dice = state.kept_dice_this_turn.len() >= 5;
    let count = state.dice_to_roll();
    let rolled = state.rng.roll_dice(count);
    let name = current_name(state);

    if dice::score_of(&rolled) == 0 {
        end_turn_with_bolt(state, true);
        hand_off(state, now, format!("{} rolled nothing and takes a bolt.", name));
        // Leave the failed roll visible to the table.
        state.dice_on_board = rolled;
        return;
    }

    if hot_dice {
        state.kept_dice_this_turn.clear();
    }
    state.dice_on_board = rolled;
    state.dice_kept_from_this_roll.clear();
    state.selected_dice_indices.clear();
    state.score_from_previous_rolls = state.current_turn_score;
    state.potential_score = 0;
    state.can_roll = false;
    state.can_bank = true;
    state.can_keep = false;
    state.game_message = format!("{} rolls...", name);
}

fn selected_values(state: &GameState) -> Vec<u8> {
    state
        .selected_dice_indices
        .iter()
        .filter_map(|&i| state.dice_on_board.get(i).copied())
        .collect()
}

/// Dice kept earlier in this roll plus the current selection.
fn combined_selection(state: &GameState) -> Vec<u8> {
    let mut combined = state.dice_kept_from_this_roll.clone();
    combined.extend(selected_values(state));
    combined
}

fn toggle_selection(state: &mut GameState, index: usize) {
    if !state.can_bank || index >= state.dice_on_board.len() {
        return;
    }

    if let Some(pos) = state.selected_dice_indices.iter().position(|&i| i == index) {
        state.selected_dice_indices.remove(pos);
    } else {
        state.selected_dice_indices.push(index);
    }

    if state.selected_dice_indices.is_empty() {
        state.can_keep = false;
        state.potential_score = 0;
        state.game_message = "Select scoring dice.".to_string();
        return;
    }

    let combined = dice::validate(&combined_selection(state));
    if combined.is_valid {
        let already = dice::validate(&state.dice_kept_from_this_roll).score;
        state.can_keep = true;
        state.potential_score = combined.score - already;
        state.game_message = format!("Selected +{}.", state.potential_score);
    } else {
        state.can_keep = false;
        state.potential_score = 0;
        state.game_message = "Select a valid combination.".to_string();
    }
}

fn keep_dice(state: &mut GameState) {
    if !state.can_bank || state.selected_dice_indices.is_empty() {
        return;
    }

    let combined = combined_selection(state);
    let validation = dice::validate(&combined);
    if !validation.is_valid {
        state.game_message = "Invalid selection.".to_string();
        return;
    }

    let new_turn_score = state.score_from_previous_rolls + validation.score;
    let added = new_turn_score - state.current_turn_score;

    let kept_now = selected_values(state);
    state.kept_dice_this_turn.extend(kept_now);
    let selected = std::mem::take(&mut state.selected_dice_indices);
    state.dice_on_board = state
        .dice_on_board
        .iter()
        .enumerate()
        .filter(|(i, _)| !selected.contains(i))
        .map(|(_, &d)| d)
        .collect();

    let hot_dice = state.dice_on_board.is_empty();
    state.dice_kept_from_this_roll = if hot_dice { Vec::new() } else { combined };
    state.current_turn_score = new_turn_score;
    state.potential_score = 0;
    state.can_roll = true;
    state.can_bank = true;
    state.can_keep = false;
    state.game_message = if hot_dice {
        format!("+{}! Turn score: {}. All dice scored, roll all five!", added, new_turn_score)
    } else {
        format!("+{}! Turn score: {}. Roll again or bank.", added, new_turn_score)
    };
}

// =============================================================================
// TURN END
// =============================================================================

fn bank_score(state: &mut GameState, now: u64) {
    if !state.can_bank {
        return;
    }

    let final_score = if state.selected_dice_indices.is_empty() {
        state.current_turn_score
    } else {
        let validation = dice::validate(&combined_selection(state));
        if validation.is_valid {
            state.score_from_previous_rolls + validation.score
        } else {
            state.current_turn_score
        }
    };

    let cur = state.current_player_index;
    let Some(player) = state.players.get(cur) else { return };
    let name = player.name.clone();
    let entered = player.has_entered_game;
    let total_before = player.total_score();
    let barrel = player.barrel();

    if final_score <= 0 {
        end_turn_with_bolt(state, true);
        hand_off(state, now, format!("{} banked nothing and takes a bolt.", name));
        return;
    }

    if !entered && final_score < ENTRY_THRESHOLD {
        state.players[cur].just_reset_from_barrel = false;
        hand_off(state, now, format!("{} needs {} to enter the game.", name, ENTRY_THRESHOLD));
        return;
    }

    if let Some(barrel) = barrel {
        if total_before + final_score < barrel.target() {
            end_turn_with_bolt(state, true);
            hand_off(state, now, format!("{} did not get off the barrel and takes a bolt.", name));
            return;
        }
    }

    {
        let player = &mut state.players[cur];
        player.scores.push(ScoreEntry::Points(final_score));
        player.has_entered_game = true;
        player.barrel_bolts = 0;
        player.just_reset_from_barrel = false;
    }
    let new_total = total_before + final_score;
    let new_barrel = Barrel::of_total(new_total);

    let mut notes = Vec::new();
    for (i, other) in state.players.iter_mut().enumerate() {
        if i == cur || !other.is_claimed {
            continue;
        }
        let other_total = other.total_score();

        if let Some(band) = new_barrel.filter(|b| other.barrel() == Some(*b)) {
            other.scores.push(ScoreEntry::Points(band.safe_total() - other_total));
            other.barrel_bolts = 0;
            notes.push(format!("{} is knocked off the barrel.", other.name));
            continue;
        }

        let overtaken = total_before < other_total && new_total >= other_total;
        if overtaken
            && other_total >= 100
            && !other.just_reset_from_barrel
            && Barrel::of_total(other_total - 50).is_none()
        {
            other.scores.push(ScoreEntry::Points(-50));
            notes.push(format!("{} is overtaken: -50.", other.name));
        }
    }

    if new_total >= WINNING_SCORE {
        state.reset_turn();
        state.is_game_over = true;
        state.game_message = format!("{} wins with {}!", name, new_total);
        return;
    }

    let mut summary = format!("{} banked {}.", name, final_score);
    for note in notes {
        summary.push(' ');
        summary.push_str(&note);
    }
    hand_off(state, now, summary);
}

/// Record a bolt for the current player, with barrel accounting if asked.
fn end_turn_with_bolt(state: &mut GameState, barrel_accounting: bool) {
    let cur = state.current_player_index;
    let Some(player) = state.players.get_mut(cur) else { return };

    player.just_reset_from_barrel = false;
    player.scores.push(ScoreEntry::Bolt);

    if !barrel_accounting {
        return;
    }
    if let Some(barrel) = player.barrel() {
        player.barrel_bolts = player.barrel_bolts.saturating_add(1);
        if player.barrel_bolts >= 3 {
            let total = player.total_score();
            player.scores.push(ScoreEntry::Points(barrel.safe_total() - total));
            player.barrel_bolts = 0;
            player.just_reset_from_barrel = true;
        }
    }
}

/// Pass the turn to the next claimed slot and clear the board.
fn hand_off(state: &mut GameState, now: u64, summary: String) {
    let next = state.next_active_player(state.current_player_index);
    state.reset_turn();
    state.current_player_index = next;
    state.can_roll = true;
    state.turn_started_at_ms = now;

    let mut message = summary;
    if let Some(player) = state.players.get(next) {
        message.push_str(&format!(" {}'s turn.", player.name));
        if !player.has_entered_game {
            message.push_str(&format!(" Needs {}+ to enter.", ENTRY_THRESHOLD));
        } else if player.barrel().is_some() {
            message.push_str(" On the barrel.");
        }
    }
    state.game_message = message;
}

fn skip_turn(state: &mut GameState, sender: &SessionId, now: u64) {
    if !in_progress(state) {
        return;
    }
    let Some(sender_slot) = state.slot_of(sender) else { return };
    if sender_slot == state.current_player_index {
        return;
    }
    let Some(current) = state.current_player() else { return };
    if current.status == PlayerStatus::Online {
        return;
    }

    let name = current.name.clone();
    end_turn_with_bolt(state, false);
    hand_off(state, now, format!("{} was skipped.", name));
}

// =============================================================================
// GAME LIFECYCLE
// =============================================================================

fn start_game(state: &mut GameState, now: u64) {
    if state.is_game_started {
        return;
    }
    if state.claimed_count() < 2 {
        state.game_message = "At least 2 players are needed to start.".to_string();
        return;
    }

    if !state.current_player().is_some_and(|p| p.is_claimed) {
        state.current_player_index = state.next_active_player(state.current_player_index);
    }

    state.reset_turn();
    state.is_game_started = true;
    state.is_game_over = false;
    state.can_roll = true;
    state.turn_started_at_ms = now;

    let name = current_name(state);
    state.game_message = format!("Game started! {}'s turn. Needs {}+ to enter.", name, ENTRY_THRESHOLD);
}

fn new_game(state: &mut GameState, now: u64) {
    for (i, player) in state.players.iter_mut().enumerate() {
        if player.is_claimed {
            player.scores.clear();
            player.has_entered_game = false;
            player.barrel_bolts = 0;
            player.just_reset_from_barrel = false;
        } else {
            *player = Player::unclaimed(i);
        }
    }

    state.leavers.clear();
    state.join_requests.clear();
    state.reset_turn();
    state.is_game_started = false;
    state.is_game_over = false;
    state.current_player_index = state.host_id.unwrap_or(0);
    state.turn_started_at_ms = now;

    state.game_message = if state.claimed_count() < 2 {
        let host = current_name(state);
        format!("{} started a new game. Waiting for players...", host)
    } else {
        "New game! Waiting for the host to start.".to_string()
    };
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

fn player_join(state: &mut GameState, name: &str, session: &SessionId, as_spectator: bool, now: u64) {
    if let Some(slot) = state.slot_of(session) {
        let player = &mut state.players[slot];
        player.status = PlayerStatus::Online;
        player.last_seen_ms = now;
        return;
    }

    let free_slot = state.players.iter().position(|p| !p.is_claimed);

    if as_spectator || free_slot.is_none() {
        if !state.is_spectator(session) {
            state.spectators.push(Spectator { name: name.to_string(), session_id: session.clone() });
            state.game_message = format!("{} is watching.", name);
        }
        return;
    }

    if in_progress(state) {
        if !state.join_requests.iter().any(|r| &r.session_id == session) {
            state.join_requests.push(JoinRequest {
                name: name.to_string(),
                session_id: session.clone(),
                requested_at_ms: now,
            });
            state.game_message = format!("{} wants to join.", name);
        }
        return;
    }

    if let Some(slot) = free_slot {
        seat(state, slot, name, session, now);
    }
}

/// Claim `slot`, restoring a rejoin-ledger score for the same name.
fn seat(state: &mut GameState, slot: usize, name: &str, session: &SessionId, now: u64) {
    let restored = state.leavers.remove(name).filter(|s| *s > 0);

    let mut player = Player::unclaimed(slot);
    player.claim(name, session, now);
    if let Some(score) = restored {
        player.scores.push(ScoreEntry::Points(score));
        player.has_entered_game = true;
    }
    state.players[slot] = player;

    state.spectators.retain(|s| &s.session_id != session);
    state.join_requests.retain(|r| &r.session_id != session);

    if !state.host_id.is_some_and(|h| state.players.get(h).is_some_and(|p| p.is_claimed)) {
        state.host_id = state.find_next_host().or(Some(slot));
    }

    state.game_message = match restored {
        Some(score) => format!("{} rejoined with {}.", name, score),
        None => format!("{} joined.", name),
    };
}

fn resolve_join_request(state: &mut GameState, session: &SessionId, accepted: bool, now: u64) {
    let Some(pos) = state.join_requests.iter().position(|r| &r.session_id == session) else {
        return;
    };
    let request = state.join_requests.remove(pos);

    let free_slot = state.players.iter().position(|p| !p.is_claimed);
    match (accepted, free_slot) {
        (true, Some(slot)) => seat(state, slot, &request.name, &request.session_id, now),
        (true, None) => {
            state.spectators.push(Spectator { name: request.name.clone(), session_id: request.session_id });
            state.game_message = format!("No seat left for {}.", request.name);
        }
        (false, _) => {
            state.spectators.push(Spectator { name: request.name.clone(), session_id: request.session_id });
            state.game_message = format!("The host declined {}.", request.name);
        }
    }
}

fn player_leave(state: &mut GameState, session: &SessionId, now: u64) {
    state.join_requests.retain(|r| &r.session_id != session);

    if let Some(pos) = state.spectators.iter().position(|s| &s.session_id == session) {
        let spectator = state.spectators.remove(pos);
        state.game_message = format!("{} left.", spectator.name);
        return;
    }

    if let Some(slot) = state.slot_of(session) {
        remove_player(state, slot, false, now);
    }
}

fn kick_player(state: &mut GameState, slot: usize, now: u64) {
    let kickable = state.players.get(slot).is_some_and(|p| p.is_claimed) && state.host_id != Some(slot);
    if kickable {
        remove_player(state, slot, true, now);
    }
}

fn remove_player(state: &mut GameState, slot: usize, kicked: bool, now: u64) {
    let removed = std::mem::replace(&mut state.players[slot], Player::unclaimed(slot));
    let total = removed.total_score();

    if kicked {
        if let Some(session_id) = removed.session_id.clone() {
            state.spectators.push(Spectator { name: removed.name.clone(), session_id });
        }
    } else if total > 0 {
        state.leavers.insert(removed.name.clone(), total);
    }

    if !state.host_is_valid() {
        state.host_id = state.find_next_host();
    }

    let verb = if kicked { "was removed" } else { "left" };
    let summary = format!("{} {}.", removed.name, verb);

    if in_progress(state) && state.claimed_count() < 2 {
        state.reset_turn();
        state.is_game_over = true;
        state.game_message = "Not enough players, game over.".to_string();
    } else if in_progress(state) && state.current_player_index == slot {
        hand_off(state, now, summary);
    } else {
        if state.current_player_index == slot {
            state.current_player_index = state.next_active_player(slot);
        }
        state.game_message = summary;
    }
}

fn heartbeat(state: &mut GameState, session: &SessionId, now: u64) {
    if let Some(slot) = state.slot_of(session) {
        let player = &mut state.players[slot];
        player.last_seen_ms = now;
        player.status = PlayerStatus::Online;
    }
}

// =============================================================================
// TESTS
// =============================================================================
