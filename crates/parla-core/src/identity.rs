use tokio::sync::watch;
use tracing::info;

/// The signed-in user whose conversations are loaded and mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Publishes sign-in and sign-out events. Authentication itself happens elsewhere.
pub struct IdentityProvider {
    sender: watch::Sender<Option<Identity>>,
}

impl IdentityProvider {
    pub fn new(initial: Option<Identity>) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn current(&self) -> Option<Identity> {
        self.sender.borrow().clone()
    }

    pub fn sign_in(&self, identity: Identity) {
        info!(user_id = %identity.user_id, "Signed in");
        self.sender.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        info!("Signed out");
        self.sender.send_replace(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.sender.subscribe()
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new(None)
    }
}
