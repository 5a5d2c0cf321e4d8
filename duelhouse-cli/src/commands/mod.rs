//! Command handlers for the Duelhouse CLI.

use chrono::{DateTime, Utc};
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::Confirm;
use duelhouse_core::world::BOARD_SIZE;
use duelhouse_core::{
    mint_anti_fraud_token, Coord, Coordinator, EntryRequirements, MoveRequest, Outcome, PieceKind,
    Session, SessionSettings, SessionStatus, WorldSnapshot,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Accept either a session UUID or a shareable join code.
async fn resolve_session(
    coordinator: &Coordinator,
    key: &str,
) -> Result<Session, Box<dyn std::error::Error>> {
    let session = match Uuid::parse_str(key) {
        Ok(id) => coordinator.session(id).await?,
        Err(_) => coordinator.session_by_code(&key.to_uppercase()).await?,
    };
    Ok(session)
}

fn parse_coord(raw: &str) -> Result<Coord, Box<dyn std::error::Error>> {
    let (x, y) = raw
        .split_once(',')
        .ok_or("Squares are written as x,y (for example 2,3)")?;
    Ok(Coord::new(x.trim().parse()?, y.trim().parse()?))
}

fn parse_piece(raw: &str) -> Result<PieceKind, Box<dyn std::error::Error>> {
    match raw.to_lowercase().as_str() {
        "scout" => Ok(PieceKind::Scout),
        "keep" => Ok(PieceKind::Keep),
        "crown" => Ok(PieceKind::Crown),
        other => Err(format!("Unknown piece kind: {}", other).into()),
    }
}

fn parse_outcome(raw: &str) -> Result<Outcome, Box<dyn std::error::Error>> {
    match raw.to_lowercase().as_str() {
        "p1" | "player1" => Ok(Outcome::Player1Win),
        "p2" | "player2" => Ok(Outcome::Player2Win),
        "draw" => Ok(Outcome::Draw),
        other => Err(format!("Unknown outcome: {} (use p1, p2 or draw)", other).into()),
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn short(wallet: &str) -> &str {
    if wallet.len() > 12 {
        &wallet[..12]
    } else {
        wallet
    }
}

/// Text rendering of the board, rank 4 at the top. Player 1 pieces are
/// uppercase.
fn render_board(snapshot: &WorldSnapshot) -> String {
    let mut out = String::new();
    for y in (0..BOARD_SIZE).rev() {
        out.push_str(&format!("{} ", y));
        for x in 0..BOARD_SIZE {
            let symbol = match snapshot.entities.iter().find(|e| e.pos == Coord::new(x, y)) {
                Some(e) => {
                    let c = match e.piece {
                        PieceKind::Scout => 's',
                        PieceKind::Keep => 'k',
                        PieceKind::Crown => 'c',
                    };
                    if e.agent == 0 {
                        c.to_ascii_uppercase()
                    } else {
                        c
                    }
                }
                None => '.',
            };
            out.push(symbol);
            out.push(' ');
        }
        out.push('\n');
    }
    out.push_str("  ");
    for x in 0..BOARD_SIZE {
        out.push_str(&format!("{} ", x));
    }
    out
}

fn print_payouts(payouts: &HashMap<String, u64>) {
    if payouts.is_empty() {
        println!("No payouts due.");
        return;
    }

    let mut rows: Vec<_> = payouts.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Wallet", "Amount"]);
    for (wallet, amount) in rows {
        table.add_row(vec![short(wallet).to_string(), format!("{} units", amount)]);
    }
    println!("{}", table);
}

pub async fn create_session(
    coordinator: &Coordinator,
    fee: u64,
    time_limit: Option<u64>,
    variant: Option<String>,
    allow: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = SessionSettings {
        move_time_limit_secs: time_limit,
        variant: variant.unwrap_or_else(|| "skirmish".to_string()),
        ..Default::default()
    };
    let entry = EntryRequirements {
        min_rating: None,
        entry_fee: fee,
        allow_list: if allow.is_empty() { None } else { Some(allow) },
    };

    let session = coordinator.create_session(settings, entry).await?;

    println!("Created new session!");
    println!("Session ID: {}", session.id);
    println!("Join Code: {}", session.code);
    println!("Entry Fee: {} units per player", session.entry.entry_fee);
    println!("Escrow Address: {}", session.escrow_address);
    println!("Expires: {}", format_ts(session.expires_at));
    println!();
    println!("Share this command with both players:");
    println!("duelhouse join <their-wallet> {}", session.code);

    Ok(())
}

pub async fn build_join(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let ticket = coordinator.build_join_transaction(session.id, wallet).await?;

    println!("Built escrow deposit for session {}", session.code);
    println!("Deposit Amount: {} units", ticket.expected_amount);
    println!("Escrow Address: {}", ticket.escrow_address);
    println!("Unsigned Tx: {}", ticket.unsigned_tx_ref);
    println!();
    println!("Sign and broadcast with your wallet, then claim the seat:");
    println!("duelhouse confirm {} {} <signed-tx-ref>", wallet, session.code);

    Ok(())
}

pub async fn confirm_join(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
    tx_ref: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let updated = coordinator.confirm_join(session.id, wallet, tx_ref).await?;

    println!("Deposit confirmed, seat claimed!");
    println!("Participants: {}/2", updated.participants.len());
    println!("Escrow Confirmed: {} units", updated.escrow_confirmed);
    match updated.status {
        SessionStatus::Countdown => {
            if let Some(ends_at) = updated.countdown_ends_at {
                println!("Session is full! Match goes live at {}", format_ts(ends_at));
            }
        }
        _ => println!("Waiting for the second player..."),
    }

    Ok(())
}

pub async fn activate(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let updated = coordinator.activate(session.id).await?;

    println!("Session {} is {}.", updated.code, updated.status);
    if let Some(at) = updated.activated_at {
        println!("Activated: {}", format_ts(at));
    }

    Ok(())
}

pub async fn submit_move(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
    from: &str,
    to: &str,
    piece: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let request = MoveRequest {
        from: parse_coord(from)?,
        to: parse_coord(to)?,
        piece: parse_piece(piece)?,
    };

    let token = mint_anti_fraud_token(wallet);
    let outcome = coordinator
        .submit_move(session.id, wallet, request, &token)
        .await?;

    if !outcome.success {
        println!(
            "Move rejected: {}",
            outcome.reason.unwrap_or_else(|| "unknown reason".to_string())
        );
        println!("World Version: {}", outcome.version);
        return Ok(());
    }

    println!("Move applied!");
    println!("Seq: {}", outcome.seq);
    println!("World Version: {}", outcome.version);
    println!("Move Hash: {}", &outcome.hash[..16]);

    // A crown capture ends the match on the spot
    let refreshed = coordinator.session(session.id).await?;
    if refreshed.status == SessionStatus::Completed {
        let result = coordinator.settlement_result(session.id).await?;
        println!();
        println!("Match is over! Outcome: {:?}", result.outcome);
        print_payouts(&result.payouts);
    }

    Ok(())
}

pub async fn undo_move(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let outcome = coordinator.undo_last_move(session.id, wallet).await?;

    println!("Move undone.");
    println!("Seq: {}", outcome.seq);
    println!("World Version: {}", outcome.version);

    Ok(())
}

pub async fn resign(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Resign session {}? Your opponent takes the pot.",
                session.code
            ))
            .default(false)
            .interact()?;

        if !confirm {
            println!("Resignation cancelled.");
            return Ok(());
        }
    }

    let result = coordinator.resign(session.id, wallet).await?;

    println!("Resigned. Outcome: {:?}", result.outcome);
    println!("Settlement Status: {}", result.status.as_str());
    print_payouts(&result.payouts);

    Ok(())
}

pub async fn list_moves(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
    from: Option<&str>,
    piece: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let from = from.map(parse_coord).transpose()?;
    let piece = piece.map(parse_piece).transpose()?;

    let moves = coordinator
        .valid_moves(session.id, wallet, from, piece)
        .await?;

    if moves.is_empty() {
        println!("No legal moves right now.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Piece", "From", "To"]);
    for mv in &moves {
        table.add_row(vec![
            mv.piece.as_str().to_string(),
            mv.from.to_string(),
            mv.to.to_string(),
        ]);
    }
    println!("{}", table);

    Ok(())
}

pub async fn show_status(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;

    println!("Session ID: {}", session.id);
    println!("Join Code: {}", session.code);
    println!("Status: {}", session.status);
    println!("Variant: {}", session.settings.variant);
    if let Some(limit) = session.settings.move_time_limit_secs {
        println!("Move Clock: {}s", limit);
    }
    println!("Entry Fee: {} units per player", session.entry.entry_fee);
    println!("Escrow Address: {}", session.escrow_address);
    println!("Escrow Confirmed: {} units", session.escrow_confirmed);
    println!("Created: {}", format_ts(session.created_at));
    println!("Expires: {}", format_ts(session.expires_at));
    if let Some(at) = session.activated_at {
        println!("Activated: {}", format_ts(at));
    }

    if !session.participants.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Player", "Wallet", "Deposit"]);
        for (index, wallet) in session.participants.iter().enumerate() {
            let deposit = session.deposits.get(wallet).copied().unwrap_or(0);
            table.add_row(vec![
                format!("{}", index + 1),
                short(wallet).to_string(),
                format!("{} units", deposit),
            ]);
        }
        println!("{}", table);
    }

    if let Ok(snapshot) = coordinator.world_snapshot(session.id).await {
        println!(
            "Board at version {}, player {} to move:",
            snapshot.version,
            snapshot.current_turn + 1
        );
        println!("{}", render_board(&snapshot));
    }

    if let Ok(result) = coordinator.settlement_result(session.id).await {
        println!("Outcome: {:?}", result.outcome);
        println!("Settlement Status: {}", result.status.as_str());
        print_payouts(&result.payouts);
    }

    Ok(())
}

pub async fn show_countdown(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let status = coordinator.countdown_status(session.id).await?;

    println!("Status: {}", status.status);
    match status.countdown_ends_at {
        Some(ends_at) => {
            println!("Countdown Ends: {}", format_ts(ends_at));
            println!("Remaining: {} ms", status.remaining_ms);
        }
        None => println!("No countdown scheduled."),
    }
    println!("Rollup Started: {}", status.rollup_started);

    Ok(())
}

pub async fn show_escrow(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let address = coordinator.escrow_address(session.id).await?;

    println!("Escrow Address: {}", address);
    println!("Entry Fee: {} units per player", session.entry.entry_fee);

    Ok(())
}

pub async fn place_bet(
    coordinator: &Coordinator,
    wallet: &str,
    session_key: &str,
    outcome: &str,
    amount: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let outcome = parse_outcome(outcome)?;

    let stake = coordinator
        .record_bet(session.id, wallet, outcome, amount)
        .await?;

    println!("Bet recorded!");
    println!("Outcome: {:?}", stake.outcome);
    println!("Stake: {} units", stake.amount);
    println!("Implied Odds: {:.2}", stake.odds_snapshot);

    Ok(())
}

pub async fn show_pool(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let pool = coordinator.betting_pool(session.id).await?;

    println!("Total Pool: {} units", pool.total_pool);
    println!("Frozen: {}", pool.frozen);
    if pool.bets.is_empty() {
        println!("No bets placed yet.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Wallet", "Outcome", "Stake", "Odds"]);
    for bet in &pool.bets {
        table.add_row(vec![
            short(&bet.wallet).to_string(),
            format!("{:?}", bet.outcome),
            format!("{} units", bet.amount),
            format!("{:.2}", bet.odds_snapshot),
        ]);
    }
    println!("{}", table);

    Ok(())
}

pub async fn show_settlement(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let result = coordinator.settlement_result(session.id).await?;

    println!("Outcome: {:?}", result.outcome);
    println!("Status: {}", result.status.as_str());
    println!("Attempts: {}", result.attempts);
    if let Some(tx_ref) = &result.ledger_tx_ref {
        println!("Ledger Tx: {}", tx_ref);
    }
    print_payouts(&result.payouts);

    Ok(())
}

pub async fn reconcile(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let result = coordinator.reconcile(session.id).await?;

    println!("Settlement is {} after reconciliation.", result.status.as_str());
    if let Some(tx_ref) = &result.ledger_tx_ref {
        println!("Ledger Tx: {}", tx_ref);
    }

    Ok(())
}

pub async fn enforce_timeout(
    coordinator: &Coordinator,
    session_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;

    match coordinator.enforce_time_limit(session.id).await? {
        Some(result) => {
            println!("Move clock exceeded, match forfeited.");
            println!("Outcome: {:?}", result.outcome);
            print_payouts(&result.payouts);
        }
        None => println!("No forfeit due."),
    }

    Ok(())
}

pub async fn sweep(coordinator: &Coordinator) -> Result<(), Box<dyn std::error::Error>> {
    let expired = coordinator.sweep_expired().await?;
    let refunded = coordinator.process_refunds().await?;

    println!("Expired {} stale sessions.", expired);
    println!("Issued {} refunds.", refunded);

    Ok(())
}

pub async fn abort(
    coordinator: &Coordinator,
    session_key: &str,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;

    if !yes {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Abort session {}? Deposits and stakes go back to their owners.",
                session.code
            ))
            .default(false)
            .interact()?;

        if !confirm {
            println!("Abort cancelled.");
            return Ok(());
        }
    }

    let result = coordinator.abort_session(session.id).await?;

    println!("Session aborted.");
    println!("Settlement Status: {}", result.status.as_str());
    print_payouts(&result.payouts);

    Ok(())
}

pub async fn export_world(
    coordinator: &Coordinator,
    session_key: &str,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = resolve_session(coordinator, session_key).await?;
    let snapshot = coordinator.world_snapshot(session.id).await?;
    let json = serde_json::to_string_pretty(&snapshot)?;

    match output {
        Some(path) => {
            tokio::fs::write(&path, json).await?;
            println!("Snapshot written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

pub async fn import_world(
    coordinator: &Coordinator,
    file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = tokio::fs::read_to_string(file).await?;
    let snapshot: WorldSnapshot = serde_json::from_str(&content)?;
    let session_id = snapshot.session_id;
    let version = snapshot.version;

    coordinator.import_snapshot(snapshot).await?;

    println!("Imported world version {} for session {}", version, session_id);

    Ok(())
}
