use clap::Subcommand;
use serde_json::json;

use crate::cli::utils::{fail, output_success, resolve_password, SETTLE_TIMEOUT};
use crate::cli::OutputFormat;
use crate::hub::Hub;
use crate::session::{SignOutOutcome, SignUpOutcome};

#[derive(Subcommand)]
pub enum AuthCommands {
    #[command(about = "Sign in with email and password")]
    SignIn {
        #[arg(help = "Email")]
        email: String,
        #[arg(long, help = "Password (reads HAVEN_PASSWORD or prompts if not provided)")]
        password: Option<String>,
    },

    #[command(about = "Create a new account")]
    SignUp {
        #[arg(help = "Email")]
        email: String,
        #[arg(long, help = "Password (reads HAVEN_PASSWORD or prompts if not provided)")]
        password: Option<String>,
    },

    #[command(about = "Sign out and forget the stored session")]
    SignOut,

    #[command(about = "Send a password reset email")]
    Reset {
        #[arg(help = "Email")]
        email: String,
    },

    #[command(about = "Show current session and privilege")]
    Status,
}

pub async fn handle(cmd: AuthCommands, hub: &Hub, output_format: OutputFormat) -> anyhow::Result<()> {
    let session = &hub.session;
    match cmd {
        AuthCommands::SignIn { email, password } => {
            let password = resolve_password(password).await?;
            let signed_in = session.sign_in(&email, &password).await.map_err(|e| fail(&output_format, e))?;
            output_success(
                &output_format,
                &format!("Signed in as {}", signed_in.display_name()),
                Some(json!({ "principal": signed_in.principal, "email": signed_in.email })),
            )
        }
        AuthCommands::SignUp { email, password } => {
            let password = resolve_password(password).await?;
            match session.sign_up(&email, &password).await.map_err(|e| fail(&output_format, e))? {
                SignUpOutcome::SignedIn(created) => output_success(
                    &output_format,
                    &format!("Account created for {}", email),
                    Some(json!({ "principal": created.principal, "confirmation_required": false })),
                ),
                SignUpOutcome::ConfirmationRequired => output_success(
                    &output_format,
                    "Registration successful! Please check your email for verification.",
                    Some(json!({ "confirmation_required": true })),
                ),
            }
        }
        AuthCommands::SignOut => match session.sign_out().await {
            SignOutOutcome::Completed => output_success(&output_format, "Signed out", None),
            SignOutOutcome::NotSignedIn => output_success(&output_format, "Not signed in", None),
            SignOutOutcome::RemoteFailed(e) => output_success(
                &output_format,
                "Signed out locally",
                Some(json!({ "warning": e.user_message() })),
            ),
        },
        AuthCommands::Reset { email } => {
            session.reset_secret(&email).await.map_err(|e| fail(&output_format, e))?;
            output_success(&output_format, &format!("Password reset email sent to {}", email), None)
        }
        AuthCommands::Status => {
            let snapshot = match tokio::time::timeout(SETTLE_TIMEOUT, hub.settled()).await {
                Ok(snapshot) => snapshot,
                Err(_) => session.snapshot(),
            };
            match &snapshot.session {
                Some(current) => output_success(
                    &output_format,
                    &format!(
                        "Signed in as {}{}",
                        current.email.as_deref().unwrap_or("unknown"),
                        if snapshot.is_privileged() { " (administrator)" } else { "" }
                    ),
                    Some(json!({
                        "signed_in": true,
                        "principal": current.principal,
                        "email": current.email,
                        "expires_at": current.expires_at,
                        "privileged": snapshot.is_privileged(),
                        "privilege_resolved": snapshot.privilege_resolved(),
                    })),
                ),
                None => output_success(&output_format, "Not signed in", Some(json!({ "signed_in": false }))),
            }
        }
    }
}
