//! TCP listener and per-connection message dispatch.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rmake_proto::{Authenticate, CodecError, MakeRequest, MsgKind};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::Result;
use crate::auth::{AuthOutcome, Authenticator, PasswordTable};
use crate::config::DaemonConfig;
use crate::conn::{Conn, ConnOptions, Request};
use crate::error::Error;
use crate::registry::RecipeBook;

/// The rmake daemon: recipes, credentials, and connection limits.
#[derive(Debug)]
pub struct Server {
    /// Compiled recipes.
    recipes: RecipeBook,
    /// Credential check for `Authenticate`.
    auth: Arc<dyn Authenticator>,
    /// Applied to every accepted connection.
    options: ConnOptions,
}

impl Server {
    /// Creates a server.
    pub fn new(recipes: RecipeBook, auth: Arc<dyn Authenticator>, options: ConnOptions) -> Self {
        Self {
            recipes,
            auth,
            options,
        }
    }

    /// Builds a server from a loaded configuration, compiling its recipes.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let recipes = RecipeBook::from_configs(&config.recipes)?;
        let auth = config
            .users
            .iter()
            .fold(PasswordTable::new(config.salt.clone()), |table, (user, pw)| {
                table.with_user(user.clone(), pw.clone())
            });
        Ok(Self::new(recipes, Arc::new(auth), config.conn_options()))
    }

    /// Configured recipes.
    pub const fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    /// Accepts connections forever, serving each on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, recipes = self.recipes.len(), "listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_tcp(stream, peer).await;
            });
        }
    }

    /// Serves one accepted TCP connection and logs how it ended.
    async fn serve_tcp(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }
        let mut conn = Conn::from_tcp(stream, self.options.clone());
        debug!(%peer, "connected");
        match self.handle(&mut conn).await {
            Ok(()) => debug!(%peer, user = %conn.user, "session closed"),
            Err(e) => warn!(%peer, user = %conn.user, error = %e, "session aborted"),
        }
        conn.shutdown().await;
    }

    /// Serves one session until goodbye, disconnect, or a fatal error.
    ///
    /// Any error means the connection must be closed; the peer has already
    /// been sent whatever reply the error calls for.
    pub async fn handle<R, W>(&self, conn: &mut Conn<R, W>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let code = match conn.read_kind().await {
                Ok(code) => code,
                Err(Error::Wire(CodecError::UnexpectedEnd)) => return Ok(()),
                Err(e) => return Err(e),
            };
            match MsgKind::from_code(code) {
                Some(MsgKind::Authenticate) => self.authenticate(conn).await?,
                Some(MsgKind::MakeRequest) => self.make_request(conn).await?,
                Some(MsgKind::Goodbye) => return Ok(()),
                _ => {
                    conn.send(MsgKind::InvalidMsg).await?;
                    return Err(Error::InvalidMsg(code));
                }
            }
        }
    }

    /// Handles `Authenticate`.
    async fn authenticate<R, W>(&self, conn: &mut Conn<R, W>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let msg = Authenticate::read(&mut conn.reader, conn.options.max_length).await?;
        match self.auth.check(&msg.username, msg.hash_type, &msg.hash) {
            AuthOutcome::Accepted => {
                info!(user = %msg.username, "authenticated");
                conn.authed = true;
                conn.user = msg.username;
                conn.send(MsgKind::Ok).await
            }
            AuthOutcome::UnsupportedHash => {
                debug!(hash_type = msg.hash_type, "unsupported hash type");
                conn.send(MsgKind::UnsupportedHash).await
            }
            AuthOutcome::Rejected => {
                warn!(user = %msg.username, "authentication failed");
                conn.send(MsgKind::AuthFailed).await?;
                Err(Error::AuthFailed)
            }
        }
    }

    /// Handles `MakeRequest` and runs the make when a recipe matches.
    async fn make_request<R, W>(&self, conn: &mut Conn<R, W>) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let msg = MakeRequest::read(&mut conn.reader, conn.options.max_length).await?;
        if !conn.authed {
            conn.send(MsgKind::AuthFailed).await?;
            return Err(Error::AuthFailed);
        }
        let [filename] = msg.filenames.as_slice() else {
            conn.send(MsgKind::InvalidParam).await?;
            return Err(Error::InvalidParam(format!(
                "expected exactly one filename, got {}",
                msg.filenames.len()
            )));
        };
        let Some(recipe) = self.recipes.select(&msg.recipe_type, filename) else {
            info!(file = %filename, recipe_type = %msg.recipe_type, "no recipe");
            return conn.send(MsgKind::MakeRequestNoRecipe).await;
        };

        info!(user = %conn.user, file = %filename, recipe = recipe.name(), "make request accepted");
        conn.request = Some(Request::new(
            Arc::clone(&recipe),
            msg.recipe_type,
            filename.clone(),
            msg.options,
        ));
        let result = match conn
            .send_text(MsgKind::MakeRequestOk, recipe.name().as_bytes())
            .await
        {
            Ok(()) => conn.make().await,
            Err(e) => Err(e),
        };
        conn.request = None;

        if let Err(e) = result {
            if e.wants_error_message()
                && let Err(send_err) = conn
                    .send_text(MsgKind::ErrorMessage, e.to_string().as_bytes())
                    .await
            {
                debug!(error = %send_err, "could not deliver error message");
            }
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use rmake_proto::HashType;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    use super::*;
    use crate::client::{Client, MakeEvent, MakeResult, Output};
    use crate::recipe::RecipeConfig;

    type TestClient = Client<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn server(root: &Path) -> Server {
        let mut config = DaemonConfig::default();
        config.scratch_root = Some(root.to_path_buf());
        config.salt = "salt".into();
        config.users.insert("alice".into(), "secret".into());
        config.recipes = vec![
            RecipeConfig::new(
                "echo",
                "*.txt",
                vec!["cp {{.Filename}} out.txt".into()],
                "out.*",
                5_000,
            ),
            RecipeConfig::new("fail", "*.fail", vec!["false".into()], "*", 5_000),
        ];
        Server::from_config(&config).unwrap()
    }

    /// Runs `handle` on one end of a pipe and `client` on the other.
    async fn session<F, T>(server: &Server, client: F) -> (Result<()>, T)
    where
        F: AsyncFnOnce(TestClient) -> T,
    {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(a);
        let mut conn = Conn::new(r, w, server.options.clone());
        let (cr, cw) = tokio::io::split(b);

        let serve = async move {
            let result = server.handle(&mut conn).await;
            drop(conn);
            result
        };
        tokio::join!(serve, client(Client::new(cr, cw)))
    }

    fn echo_request() -> MakeRequest {
        MakeRequest {
            recipe_type: String::new(),
            filenames: vec!["in.txt".into()],
            options: BTreeMap::new(),
        }
    }

    fn in_txt() -> Vec<(String, Vec<u8>)> {
        vec![("in.txt".into(), b"hello".to_vec())]
    }

    #[tokio::test]
    async fn authenticated_make_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, (made, events)) = session(&server, async |mut c| {
            c.authenticate("alice", "secret", "salt").await.unwrap();
            let mut events = Vec::new();
            let made = c
                .make(&echo_request(), &in_txt(), |e| events.push(e))
                .await
                .unwrap();
            c.goodbye().await.unwrap();
            (made, events)
        })
        .await;

        result.unwrap();
        assert_eq!(
            made,
            MakeResult {
                recipe: "echo".into(),
                outputs: vec![Output {
                    name: "out.txt".into(),
                    data: b"hello".to_vec(),
                }],
            }
        );
        assert_eq!(
            events,
            [MakeEvent::Status("Executing: \"cp in.txt out.txt\"".into())]
        );
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn session_serves_consecutive_requests() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, ()) = session(&server, async |mut c| {
            c.authenticate("alice", "secret", "salt").await.unwrap();
            for _ in 0..2 {
                let made = c.make(&echo_request(), &in_txt(), |_| {}).await.unwrap();
                assert_eq!(made.outputs.len(), 1);
            }
            c.goodbye().await.unwrap();
        })
        .await;
        result.unwrap();
    }

    #[tokio::test]
    async fn make_before_authentication_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, reply) = session(&server, async |mut c| {
            c.make(&echo_request(), &in_txt(), |_| {}).await
        })
        .await;

        assert!(matches!(result, Err(Error::AuthFailed)));
        assert!(matches!(reply, Err(Error::Rejected(MsgKind::AuthFailed))));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn wrong_password_closes_session() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, reply) = session(&server, async |mut c| {
            c.authenticate("alice", "guess", "salt").await
        })
        .await;

        assert!(matches!(result, Err(Error::AuthFailed)));
        assert!(matches!(reply, Err(Error::Rejected(MsgKind::AuthFailed))));
    }

    #[tokio::test]
    async fn unsupported_hash_keeps_session_open() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, ()) = session(&server, async |mut c| {
            let unknown = HashType::Sha256.code() + 7;
            let reply = c.authenticate_with(unknown, "alice", vec![0; 32]).await;
            assert!(matches!(reply, Err(Error::Rejected(MsgKind::UnsupportedHash))));
            c.authenticate("alice", "secret", "salt").await.unwrap();
            c.goodbye().await.unwrap();
        })
        .await;
        result.unwrap();
    }

    #[tokio::test]
    async fn unmatched_request_keeps_session_open() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, ()) = session(&server, async |mut c| {
            c.authenticate("alice", "secret", "salt").await.unwrap();
            let mut req = echo_request();
            req.filenames = vec!["main.rs".into()];
            let reply = c.make(&req, &[], |_| {}).await;
            assert!(matches!(
                reply,
                Err(Error::Rejected(MsgKind::MakeRequestNoRecipe))
            ));

            req.recipe_type = "echo".into();
            let made = c
                .make(&req, &[("main.rs".into(), b"fn main() {}".to_vec())], |_| {})
                .await;
            // The recipe copies `main.rs`, which exists, to out.txt.
            assert_eq!(made.unwrap().outputs[0].data, b"fn main() {}");
            c.goodbye().await.unwrap();
        })
        .await;
        result.unwrap();
    }

    #[tokio::test]
    async fn multiple_filenames_are_invalid() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, reply) = session(&server, async |mut c| {
            c.authenticate("alice", "secret", "salt").await.unwrap();
            let mut req = echo_request();
            req.filenames.push("b.txt".into());
            c.make(&req, &in_txt(), |_| {}).await
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidParam(_))));
        assert!(matches!(reply, Err(Error::Rejected(MsgKind::InvalidParam))));
    }

    #[tokio::test]
    async fn command_failure_is_reported_as_error_message() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, reply) = session(&server, async |mut c| {
            c.authenticate("alice", "secret", "salt").await.unwrap();
            let mut req = echo_request();
            req.filenames = vec!["x.fail".into()];
            c.make(&req, &[], |_| {}).await
        })
        .await;

        assert!(matches!(result, Err(Error::CommandFailed { .. })));
        let Err(Error::Remote(text)) = reply else {
            panic!("expected a remote error");
        };
        assert!(text.contains("\"false\" failed"));
        assert!(std::fs::read_dir(root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn unknown_message_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());
        let (a, mut b) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(a);
        let mut conn = Conn::new(r, w, server.options.clone());

        rmake_proto::write_i16(&mut b, 999).await.unwrap();
        let result = server.handle(&mut conn).await;
        drop(conn);

        assert!(matches!(result, Err(Error::InvalidMsg(999))));
        assert_eq!(rmake_proto::read_kind(&mut b).await.unwrap(), MsgKind::InvalidMsg.code());
        assert!(matches!(
            rmake_proto::read_kind(&mut b).await,
            Err(CodecError::UnexpectedEnd)
        ));
    }

    #[tokio::test]
    async fn disconnect_between_messages_is_clean() {
        let root = tempfile::tempdir().unwrap();
        let server = server(root.path());

        let (result, ()) = session(&server, async |c| drop(c)).await;
        result.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_over_tcp() {
        let root = tempfile::tempdir().unwrap();
        let server = Arc::new(server(root.path()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let daemon = tokio::spawn(Arc::clone(&server).serve(listener));

        let mut c = Client::connect(addr).await.unwrap();
        c.authenticate("alice", "secret", "salt").await.unwrap();
        let made = c.make(&echo_request(), &in_txt(), |_| {}).await.unwrap();
        assert_eq!(made.outputs[0].name, "out.txt");
        c.goodbye().await.unwrap();

        daemon.abort();
    }
}
