use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use bargain_core::{App, AppAction, AppReconciler, AppUpdate, PartySide};
use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "bargain")]
#[command(about = "Interactive negotiation client for driving a live relay by hand")]
struct Cli {
    /// Data directory (config + logs persist here between runs)
    #[arg(long, default_value = ".bargain")]
    data_dir: String,

    /// Party id this client registers under
    #[arg(long)]
    party_id: String,

    /// Which end of the negotiation this client is
    #[arg(long, value_enum)]
    side: Side,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Side {
    Farmer,
    Buyer,
}

/// Prints every update as it lands. Output interleaves with the prompt; this
/// is a debugging surface, not a UI.
struct PrintingReconciler;

impl AppReconciler for PrintingReconciler {
    fn reconcile(&self, update: AppUpdate) {
        match update {
            AppUpdate::FullState(state) => {
                if let Some(room) = &state.open_room {
                    if let Some(last) = room.messages.last() {
                        println!(
                            "<< [{}] {} {}: {}",
                            room.room_id, last.time_label, last.sender_id, last.text
                        );
                    }
                }
                if let Some(call) = &state.active_call {
                    println!("<< call {:?} (muted: {})", call.status, call.is_muted);
                }
                if let Some(prompt) = &state.incoming_call {
                    println!(
                        "<< incoming call from {} ({}): accept / dismiss",
                        prompt.caller_id, prompt.room_id
                    );
                }
            }
            AppUpdate::ConnectivityChanged { connected, .. } => {
                println!("<< {}", if connected { "connected" } else { "disconnected" });
            }
            AppUpdate::RoomListChanged { room_list, .. } => {
                println!("<< {} active room(s)", room_list.len());
            }
            AppUpdate::ToastChanged { toast, .. } => {
                if let Some(toast) = toast {
                    println!("<< toast: {toast}");
                }
            }
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  open <counterpart>   open the negotiation room with a party");
    println!("  close                close the open room");
    println!("  send <text>          send a message into the open room");
    println!("  call                 start a call in the open room");
    println!("  accept | dismiss     answer or ignore an incoming call");
    println!("  end                  hang up");
    println!("  mute                 toggle the microphone");
    println!("  audio                activate audio playout after a block");
    println!("  rooms                list active rooms");
    println!("  state                dump the full state snapshot");
    println!("  quit");
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let side = match cli.side {
        Side::Farmer => PartySide::Farmer,
        Side::Buyer => PartySide::Buyer,
    };

    let app = App::new(cli.data_dir, cli.party_id, side);
    app.listen_for_updates(Arc::new(PrintingReconciler));
    app.dispatch(AppAction::Connect);
    print_help();

    let stdin = std::io::stdin();
    let mut reader = stdin.lock();
    let mut line = String::new();
    loop {
        print!("> ");
        std::io::stdout().flush().context("flush prompt")?;
        line.clear();
        if reader.read_line(&mut line).context("read command")? == 0 {
            break;
        }
        let input = line.trim();
        let (cmd, rest) = match input.split_once(' ') {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (input, ""),
        };
        match cmd {
            "" => {}
            "open" if !rest.is_empty() => app.dispatch(AppAction::OpenRoom {
                counterpart_id: rest.to_string(),
            }),
            "open" => println!("usage: open <counterpart>"),
            "close" => app.dispatch(AppAction::CloseRoom),
            "send" => match app.state().open_room {
                Some(room) if !rest.is_empty() => app.dispatch(AppAction::SendMessage {
                    room_id: room.room_id,
                    text: rest.to_string(),
                }),
                Some(_) => println!("usage: send <text>"),
                None => println!("no open room"),
            },
            "call" => match app.state().open_room {
                Some(room) => app.dispatch(AppAction::StartCall {
                    room_id: room.room_id,
                }),
                None => println!("no open room"),
            },
            "accept" => app.dispatch(AppAction::AcceptIncomingCall),
            "dismiss" => app.dispatch(AppAction::DismissIncomingCall),
            "end" => app.dispatch(AppAction::EndCall),
            "mute" => app.dispatch(AppAction::ToggleMute),
            "audio" => app.dispatch(AppAction::ActivateAudio),
            "rooms" => {
                for room in app.state().room_list {
                    println!(
                        "  {} [{}] {}",
                        room.room_id,
                        room.last_time_label.unwrap_or_default(),
                        room.last_message.unwrap_or_default()
                    );
                }
            }
            "state" => println!("{:#?}", app.state()),
            "help" => print_help(),
            "quit" | "exit" => break,
            other => println!("unknown command: {other} (try `help`)"),
        }
    }

    app.dispatch(AppAction::Shutdown);
    Ok(())
}
