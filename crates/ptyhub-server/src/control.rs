//! Line-oriented JSON control channel.
//!
//! Reads one [`RequestEnvelope`] per line, runs it against the manager and
//! writes one [`ResponseEnvelope`] per line. Request failures become
//! `error` responses; only I/O errors on the channel itself end the loop.

use crate::session::PtyManager;
use ptyhub_core::{
    decode_line, encode_line, PtyResult, Request, RequestEnvelope, Response, ResponseEnvelope,
    SessionCreated, SessionState,
};
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Serve requests from `input` until it reaches EOF.
///
/// Requests that name no user act on behalf of `default_user`.
pub async fn serve<R, W>(
    manager: &PtyManager,
    input: R,
    mut output: W,
    default_user: &str,
) -> PtyResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match decode_line::<RequestEnvelope>(&line) {
            Ok(env) => ResponseEnvelope {
                id: env.id,
                response: handle_request(manager, env.request, default_user).await,
            },
            Err(e) => {
                warn!(error = %e, "malformed control request");
                ResponseEnvelope {
                    id: None,
                    response: Response::from(&e),
                }
            }
        };

        output.write_all(&encode_line(&envelope)?).await?;
        output.flush().await?;
    }

    info!("control channel closed");
    Ok(())
}

/// Run a single request and build its response.
pub async fn handle_request(manager: &PtyManager, request: Request, default_user: &str) -> Response {
    debug!(?request, "control request");
    let result = match request {
        Request::Create {
            user,
            rows,
            cols,
            cwd,
            shell,
        } => {
            let user = user.as_deref().unwrap_or(default_user);
            manager
                .create_session(user, rows, cols, cwd.as_deref().map(Path::new), shell.as_deref())
                .await
                .map(|session_id| {
                    Response::Created(SessionCreated {
                        session_id,
                        status: SessionState::Running,
                    })
                })
        }
        Request::Input { session_id, data } => manager
            .input(&session_id, data.as_bytes())
            .await
            .map(|()| Response::Ok),
        Request::Output { session_id, seq } => manager
            .output(&session_id, seq)
            .await
            .map(|delta| Response::Output(delta.into())),
        Request::Resize {
            session_id,
            rows,
            cols,
        } => manager
            .resize(&session_id, rows, cols)
            .await
            .map(|()| Response::Ok),
        Request::Close { session_id } => {
            manager.close_session(&session_id).await;
            Ok(Response::Ok)
        }
        Request::List { user } => {
            let user = user.as_deref().unwrap_or(default_user);
            Ok(Response::Sessions {
                sessions: manager.list_sessions(user).await,
            })
        }
        Request::Status { session_id } => manager.status(&session_id).await.map(Response::Status),
    };

    result.unwrap_or_else(|e| Response::from(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManagerConfig;
    use ptyhub_core::{ErrorKind, InputData};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn manager() -> PtyManager {
        PtyManager::new(ManagerConfig {
            default_shell: "/bin/sh".into(),
            default_cwd: Some(PathBuf::from("/tmp")),
            close_grace: Duration::from_millis(300),
            ..ManagerConfig::default()
        })
    }

    async fn run_lines(manager: &PtyManager, input: &str) -> Vec<ResponseEnvelope> {
        let mut out = Vec::new();
        serve(manager, input.as_bytes(), &mut out, "tester").await.unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect()
    }

    async fn created_id(manager: &PtyManager) -> String {
        let request = Request::Create {
            user: None,
            rows: 24,
            cols: 80,
            cwd: None,
            shell: None,
        };
        match handle_request(manager, request, "tester").await {
            Response::Created(created) => created.session_id,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_session_over_the_channel() {
        let manager = manager();
        let id = created_id(&manager).await;

        let input = Request::Input {
            session_id: id.clone(),
            data: "echo ctl-$((6 * 7))\n".into(),
        };
        assert_eq!(handle_request(&manager, input, "tester").await, Response::Ok);
        let raw = Request::Input {
            session_id: id.clone(),
            data: InputData::Bytes(vec![b'#', 0xff, b'\n']),
        };
        assert_eq!(handle_request(&manager, raw, "tester").await, Response::Ok);

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seq = 0;
        let mut seen = String::new();
        while !seen.contains("ctl-42") && Instant::now() < deadline {
            let poll = Request::Output {
                session_id: id.clone(),
                seq,
            };
            match handle_request(&manager, poll, "tester").await {
                Response::Output(out) => {
                    seen.push_str(&out.output);
                    seq = out.seq;
                }
                other => panic!("unexpected response: {other:?}"),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(seen.contains("ctl-42"));

        let listed = handle_request(&manager, Request::List { user: None }, "tester").await;
        match listed {
            Response::Sessions { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].session_id, id);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let close = Request::Close {
            session_id: id.clone(),
        };
        assert_eq!(handle_request(&manager, close.clone(), "tester").await, Response::Ok);
        assert_eq!(handle_request(&manager, close, "tester").await, Response::Ok);

        let status = handle_request(&manager, Request::Status { session_id: id }, "tester").await;
        assert!(matches!(
            status,
            Response::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn serve_answers_each_line_with_matching_id() {
        let manager = manager();
        let input = concat!(
            "{\"id\":1,\"op\":\"list\"}\n",
            "\n",
            "{\"id\":2,\"op\":\"output\",\"session_id\":\"missing\"}\n",
            "not json\n",
            "{\"id\":3,\"op\":\"resize\",\"session_id\":\"missing\",\"rows\":1,\"cols\":1}\n",
        );
        let responses = run_lines(&manager, input).await;
        assert_eq!(responses.len(), 4);

        assert_eq!(responses[0].id, Some(1));
        assert_eq!(responses[0].response, Response::Sessions { sessions: vec![] });

        assert_eq!(responses[1].id, Some(2));
        assert!(matches!(
            responses[1].response,
            Response::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));

        assert_eq!(responses[2].id, None);
        assert!(matches!(
            responses[2].response,
            Response::Error {
                kind: ErrorKind::InvalidRequest,
                ..
            }
        ));

        assert_eq!(responses[3].id, Some(3));
    }

    #[tokio::test]
    async fn creation_errors_are_reported_by_kind() {
        let manager = manager();
        let request = Request::Create {
            user: Some("alice".into()),
            rows: 24,
            cols: 80,
            cwd: Some("/no/such/dir".into()),
            shell: None,
        };
        assert!(matches!(
            handle_request(&manager, request, "tester").await,
            Response::Error {
                kind: ErrorKind::CreationFailed,
                ..
            }
        ));
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn quota_errors_are_reported_by_kind() {
        let manager = PtyManager::new(ManagerConfig {
            default_shell: "/bin/sh".into(),
            default_cwd: Some(PathBuf::from("/tmp")),
            max_sessions_per_user: 1,
            ..ManagerConfig::default()
        });
        created_id(&manager).await;
        let request = Request::Create {
            user: None,
            rows: 24,
            cols: 80,
            cwd: None,
            shell: None,
        };
        assert!(matches!(
            handle_request(&manager, request, "tester").await,
            Response::Error {
                kind: ErrorKind::ResourceExhausted,
                ..
            }
        ));
        manager.shutdown().await;
    }
}
