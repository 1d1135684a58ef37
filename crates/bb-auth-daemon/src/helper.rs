//! Policy sessions backed by `polkit-agent-helper-1`.
//!
//! The setuid helper shipped with polkit performs the actual PAM
//! conversation. It is spawned per attempt with the target user as its
//! only argument, receives the cookie and responses on stdin, and reports
//! the conversation on stdout as tagged lines (`PAM_PROMPT_ECHO_OFF`,
//! `PAM_TEXT_INFO`, ..., then `SUCCESS` or `FAILURE`).
//!
//! Each [`HelperSession`] drives one helper process from a background
//! task; the [`PolicySession`] methods just enqueue commands so the
//! bridge never blocks on the child.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use bb_auth_core::Secret;

use crate::agent::{AgentEvent, AgentHandle};
use crate::polkit::{PolicySession, PolicySessionFactory, PolkitEvent};

/// Path of the setuid PAM helper.
pub const HELPER_PATH: &str = "/usr/lib/polkit-1/polkit-agent-helper-1";

/// Factory producing helper-backed policy sessions.
#[derive(Default)]
pub struct HelperSessionFactory;

impl PolicySessionFactory for HelperSessionFactory {
    fn create(&mut self, cookie: &str, user: &str, events: AgentHandle) -> Box<dyn PolicySession> {
        Box::new(HelperSession::spawn_driver(cookie, user, events))
    }
}

enum HelperCmd {
    Initiate,
    Respond(Secret),
    Cancel,
}

/// Handle to one helper process driver.
pub struct HelperSession {
    cmd_tx: mpsc::UnboundedSender<HelperCmd>,
}

impl HelperSession {
    fn spawn_driver(cookie: &str, user: &str, events: AgentHandle) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_helper(
            cookie.to_owned(),
            user.to_owned(),
            events,
            cmd_rx,
        ));
        Self { cmd_tx }
    }
}

impl PolicySession for HelperSession {
    fn initiate(&mut self) {
        let _ = self.cmd_tx.send(HelperCmd::Initiate);
    }

    fn respond(&mut self, response: Secret) {
        let _ = self.cmd_tx.send(HelperCmd::Respond(response));
    }

    fn cancel(&mut self) {
        let _ = self.cmd_tx.send(HelperCmd::Cancel);
    }
}

/// Parsed line of the helper's stdout protocol.
#[derive(Debug, PartialEq, Eq)]
enum HelperMessage {
    PromptEchoOff(String),
    PromptEchoOn(String),
    TextInfo(String),
    TextError(String),
    Success,
    Failure,
    Unknown(String),
}

fn parse_helper_line(line: &str) -> HelperMessage {
    if let Some(prompt) = line.strip_prefix("PAM_PROMPT_ECHO_OFF") {
        HelperMessage::PromptEchoOff(prompt.trim().to_owned())
    } else if let Some(prompt) = line.strip_prefix("PAM_PROMPT_ECHO_ON") {
        HelperMessage::PromptEchoOn(prompt.trim().to_owned())
    } else if let Some(info) = line.strip_prefix("PAM_TEXT_INFO") {
        HelperMessage::TextInfo(info.trim().to_owned())
    } else if let Some(error) = line.strip_prefix("PAM_TEXT_ERROR") {
        HelperMessage::TextError(error.trim().to_owned())
    } else if line == "SUCCESS" {
        HelperMessage::Success
    } else if line == "FAILURE" {
        HelperMessage::Failure
    } else {
        HelperMessage::Unknown(line.to_owned())
    }
}

async fn kill_helper(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn drive_helper(
    cookie: String,
    user: String,
    events: AgentHandle,
    mut cmd_rx: mpsc::UnboundedReceiver<HelperCmd>,
) {
    // The bridge always initiates before anything else; a dropped sender
    // means the attempt was abandoned before it started.
    match cmd_rx.recv().await {
        Some(HelperCmd::Initiate) => {}
        _ => return,
    }

    let completed = |gained: bool| {
        events.send(AgentEvent::Polkit(PolkitEvent::SessionCompleted {
            cookie: cookie.clone(),
            gained_authorization: gained,
        }));
    };

    let mut child = match Command::new(HELPER_PATH)
        .arg(&user)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!("failed to spawn {HELPER_PATH}: {e}");
            completed(false);
            return;
        }
    };

    let Some(mut stdin) = child.stdin.take() else {
        kill_helper(&mut child).await;
        completed(false);
        return;
    };
    let Some(stdout) = child.stdout.take() else {
        kill_helper(&mut child).await;
        completed(false);
        return;
    };

    if stdin.write_all(format!("{cookie}\n").as_bytes()).await.is_err() {
        kill_helper(&mut child).await;
        completed(false);
        return;
    }

    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(HelperCmd::Respond(response)) => {
                    let mut buf =
                        Zeroizing::new(response.expose().as_bytes().to_vec());
                    buf.push(b'\n');
                    if stdin.write_all(&buf).await.is_err()
                        || stdin.flush().await.is_err()
                    {
                        kill_helper(&mut child).await;
                        completed(false);
                        return;
                    }
                }
                Some(HelperCmd::Cancel) | None => {
                    debug!("cancelling helper for {cookie}");
                    kill_helper(&mut child).await;
                    return;
                }
                Some(HelperCmd::Initiate) => {}
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    // Helper closed stdout without a verdict.
                    kill_helper(&mut child).await;
                    completed(false);
                    return;
                };
                match parse_helper_line(&line) {
                    HelperMessage::PromptEchoOff(prompt) => {
                        events.send(AgentEvent::Polkit(PolkitEvent::SessionRequest {
                            cookie: cookie.clone(),
                            prompt,
                            echo: false,
                        }));
                    }
                    HelperMessage::PromptEchoOn(prompt) => {
                        events.send(AgentEvent::Polkit(PolkitEvent::SessionRequest {
                            cookie: cookie.clone(),
                            prompt,
                            echo: true,
                        }));
                    }
                    HelperMessage::TextInfo(text) => {
                        events.send(AgentEvent::Polkit(PolkitEvent::SessionShowInfo {
                            cookie: cookie.clone(),
                            text,
                        }));
                    }
                    HelperMessage::TextError(text) => {
                        events.send(AgentEvent::Polkit(PolkitEvent::SessionShowError {
                            cookie: cookie.clone(),
                            text,
                        }));
                    }
                    HelperMessage::Success => {
                        let _ = child.wait().await;
                        completed(true);
                        return;
                    }
                    HelperMessage::Failure => {
                        let _ = child.wait().await;
                        completed(false);
                        return;
                    }
                    HelperMessage::Unknown(line) => {
                        debug!("unrecognized helper output: {line}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prompts() {
        assert_eq!(
            parse_helper_line("PAM_PROMPT_ECHO_OFF Password:"),
            HelperMessage::PromptEchoOff("Password:".into())
        );
        assert_eq!(
            parse_helper_line("PAM_PROMPT_ECHO_OFF"),
            HelperMessage::PromptEchoOff(String::new())
        );
        assert_eq!(
            parse_helper_line("PAM_PROMPT_ECHO_ON Login:"),
            HelperMessage::PromptEchoOn("Login:".into())
        );
    }

    #[test]
    fn parses_text_and_verdicts() {
        assert_eq!(
            parse_helper_line("PAM_TEXT_INFO Place your finger on the reader"),
            HelperMessage::TextInfo("Place your finger on the reader".into())
        );
        assert_eq!(
            parse_helper_line("PAM_TEXT_ERROR Authentication failure"),
            HelperMessage::TextError("Authentication failure".into())
        );
        assert_eq!(parse_helper_line("SUCCESS"), HelperMessage::Success);
        assert_eq!(parse_helper_line("FAILURE"), HelperMessage::Failure);
        assert_eq!(
            parse_helper_line("SOMETHING_ELSE"),
            HelperMessage::Unknown("SOMETHING_ELSE".into())
        );
    }
}
