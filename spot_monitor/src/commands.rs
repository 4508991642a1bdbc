// THEORY:
// Operator input arrives on stdin, one command per line, and is turned into
// discrete events on a channel. The frame loop drains the channel between
// frames, so a command always applies to a whole frame boundary and never
// interleaves with an engine call.
//
//   b  reset the baseline from the current frame
//   s  save a screenshot of the current annotated frame
//   q  stop after the current frame
//
// The reader runs on its own OS thread and stops reading once `q` is seen.

use std::io::{self, BufRead};
use std::thread;

use log::warn;
use spot_vision::OperatorCommand;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Engine(OperatorCommand),
    Quit,
}

pub fn parse_command(line: &str) -> Option<HostCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "b" => Some(HostCommand::Engine(OperatorCommand::ResetBaseline)),
        "s" => Some(HostCommand::Engine(OperatorCommand::SaveFrame)),
        "q" => Some(HostCommand::Quit),
        _ => None,
    }
}

/// Forwards parsed lines from `reader` until it runs dry, a `q` is sent or
/// the receiver is dropped. Blocks the calling thread.
pub fn forward_commands<R: BufRead>(reader: R, tx: &mpsc::Sender<HostCommand>) {
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        match parse_command(&line) {
            Some(command) => {
                if tx.blocking_send(command).is_err() || command == HostCommand::Quit {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => warn!("unknown command {:?}, expected b, s or q", line.trim()),
        }
    }
}

/// Reads stdin on a detached OS thread that ends with the process, never on
/// the tokio runtime.
pub fn spawn_stdin_reader() -> io::Result<mpsc::Receiver<HostCommand>> {
    let (tx, rx) = mpsc::channel(16);
    thread::Builder::new()
        .name("stdin-commands".into())
        .spawn(move || forward_commands(io::stdin().lock(), &tx))?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_letter_commands() {
        assert_eq!(parse_command("b"), Some(HostCommand::Engine(OperatorCommand::ResetBaseline)));
        assert_eq!(parse_command(" S \n"), Some(HostCommand::Engine(OperatorCommand::SaveFrame)));
        assert_eq!(parse_command("q"), Some(HostCommand::Quit));
        assert_eq!(parse_command("quit"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn forwarding_stops_at_quit() {
        let (tx, mut rx) = mpsc::channel(8);
        let input = io::Cursor::new("x\n\nb\nq\ns\n");
        forward_commands(input, &tx);
        drop(tx);

        assert_eq!(rx.try_recv(), Ok(HostCommand::Engine(OperatorCommand::ResetBaseline)));
        assert_eq!(rx.try_recv(), Ok(HostCommand::Quit));
        assert!(rx.try_recv().is_err(), "nothing after q may be forwarded");
    }

    #[test]
    fn forwarding_ends_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward_commands(io::Cursor::new("b\ns\nb\n"), &tx);
    }
}
