//! Command dispatch on top of the session manager and progress monitor

use anyhow::{anyhow, Context};
use rehearsekit_progress::{HostContext, ProgressMonitor};
use rehearsekit_shared::{ClientConfig, CredentialPair, Identity, ProgressUpdate, SessionManager};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Time given to the background logout notification before the process exits
const LOGOUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { access: String, refresh: String },
    Whoami { json: bool },
    Logout,
    Watch { job_id: String, origin: Option<String> },
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let Some((name, rest)) = args.split_first() else {
            return Err("no command given".to_string());
        };

        match name.as_str() {
            "login" => match rest {
                [access, refresh] => Ok(Command::Login {
                    access: access.clone(),
                    refresh: refresh.clone(),
                }),
                _ => Err("login expects <access-token> <refresh-token>".to_string()),
            },
            "whoami" => match rest {
                [] => Ok(Command::Whoami { json: false }),
                [flag] if flag == "--json" => Ok(Command::Whoami { json: true }),
                _ => Err("whoami accepts only --json".to_string()),
            },
            "logout" if rest.is_empty() => Ok(Command::Logout),
            "logout" => Err("logout takes no arguments".to_string()),
            "watch" => match rest {
                [job_id] => Ok(Command::Watch {
                    job_id: job_id.clone(),
                    origin: None,
                }),
                [job_id, flag, origin] if flag == "--origin" => Ok(Command::Watch {
                    job_id: job_id.clone(),
                    origin: Some(origin.clone()),
                }),
                _ => Err("watch expects <job-id> [--origin <url>]".to_string()),
            },
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

pub struct RehearseApp {
    config: ClientConfig,
}

impl RehearseApp {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Login { access, refresh } => self.login(access, refresh).await,
            Command::Whoami { json } => self.whoami(json).await,
            Command::Logout => self.logout().await,
            Command::Watch { job_id, origin } => self.watch(&job_id, origin.as_deref()).await,
        }
    }

    fn session(&self) -> anyhow::Result<SessionManager> {
        let api_url = self.config.api.resolved_api_url();
        debug!("Using API at {}", api_url);

        SessionManager::from_config(&self.config, &api_url)
            .context("failed to set up session manager")
    }

    async fn login(&self, access: String, refresh: String) -> anyhow::Result<()> {
        let session = self.session()?;
        session.login(CredentialPair::new(access, refresh)).await;

        let identity = session
            .identity()
            .ok_or_else(|| anyhow!("the backend did not accept these credentials"))?;

        println!("Signed in as {}", describe(&identity));
        if identity.is_pending_approval() {
            println!("Your account is awaiting approval by an administrator.");
        }
        Ok(())
    }

    async fn whoami(&self, json: bool) -> anyhow::Result<()> {
        let session = self.session()?;
        session.fetch_identity().await;

        match session.identity() {
            Some(identity) if json => println!("{}", serde_json::to_string_pretty(&identity)?),
            Some(identity) => println!("{}", describe(&identity)),
            None => println!("not signed in"),
        }
        Ok(())
    }

    async fn logout(&self) -> anyhow::Result<()> {
        let session = self.session()?;
        session.logout();
        tokio::time::sleep(LOGOUT_GRACE).await;

        println!("Signed out");
        Ok(())
    }

    async fn watch(&self, job_id: &str, origin: Option<&str>) -> anyhow::Result<()> {
        let host = origin.map(HostContext::parse).transpose()?;
        let monitor = ProgressMonitor::new(host.as_ref(), &self.config.progress)?;
        let max_attempts = self.config.progress.max_reconnect_attempts;

        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let mut client = monitor
            .watch(job_id, move |update| {
                // Receiver gone means we are shutting down
                let _ = tx.send(update);
            })
            .with_error_callback(|e| warn!("Progress channel error: {}", e));

        let mut state = client.subscribe_state();
        client.connect();
        info!("Watching job {}", job_id);

        let outcome = loop {
            tokio::select! {
                update = rx.recv() => {
                    let Some(update) = update else {
                        break Ok(());
                    };
                    println!("{}", render(&update));
                    if update.status.is_terminal() {
                        break Ok(());
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    state.borrow_and_update();
                    if client.is_exhausted() {
                        break Err(anyhow!(
                            "lost the progress channel for job {} after {} reconnection attempts",
                            job_id,
                            max_attempts
                        ));
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break Ok(());
                }
            }
        };

        client.disconnect();
        outcome
    }
}

fn describe(identity: &Identity) -> String {
    let mut line = identity.display_name().to_string();
    if let Some(email) = identity.email.as_deref() {
        if email != line {
            line.push_str(&format!(" <{}>", email));
        }
    }
    if identity.is_admin {
        line.push_str(" [admin]");
    }
    line
}

fn render(update: &ProgressUpdate) -> String {
    let mut line = format!(
        "[{}] {:>3}% {}",
        update.job_id, update.progress_percent, update.status
    );
    if let Some(message) = &update.message {
        line.push_str(" - ");
        line.push_str(message);
    }
    line
}
