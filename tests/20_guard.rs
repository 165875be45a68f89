mod common;

use anyhow::Result;
use common::{within, Fixture, ADMIN_EMAIL, PASSWORD, USER_EMAIL};

use apphaven_hub::guard::{GuardDecision, Route};

fn settled(decision: &GuardDecision) -> bool {
    decision.is_settled()
}

#[tokio::test]
async fn signed_out_visitor_is_sent_to_sign_in_with_return_path() -> Result<()> {
    let fx = Fixture::new("guard-signed-out").await?;
    fx.settled().await?;

    for route in [Route::protected("/upload"), Route::privileged("/admin")] {
        let path = route.path.clone();
        let mut watch = fx.hub.guard_route(route);
        let decision = within("guard decision", watch.wait_until(settled)).await?;
        assert_eq!(
            decision,
            Some(GuardDecision::Unauthenticated { redirect: "/auth".into(), return_to: path })
        );
    }
    Ok(())
}

#[tokio::test]
async fn sign_in_returns_to_the_original_admin_path() -> Result<()> {
    let fx = Fixture::new("guard-return").await?;
    fx.memory.set_profile(&fx.user, "user", true).await;
    fx.settled().await?;

    let mut watch = fx.hub.guard_route(Route::privileged("/admin"));
    let Some(GuardDecision::Unauthenticated { return_to, .. }) =
        within("unauthenticated", watch.wait_until(settled)).await?
    else {
        anyhow::bail!("expected a sign-in redirect");
    };
    assert_eq!(fx.hub.guard.sign_in_location(&return_to), "/auth?redirect=%2Fadmin");

    let session = fx.hub.session.sign_in("user@example.com", "secret123").await?;
    assert_eq!(session.principal, fx.user);
    assert_eq!(fx.hub.guard.post_sign_in_target(Some(&return_to)), "/admin");

    let decision = within("granted", watch.wait_until(|d| *d == GuardDecision::Granted)).await?;
    assert_eq!(decision, Some(GuardDecision::Granted));
    Ok(())
}

#[tokio::test]
async fn plain_user_is_forbidden_from_admin_but_not_upload_route() -> Result<()> {
    let fx = Fixture::new("guard-forbidden").await?;
    fx.sign_in_as(USER_EMAIL).await?;

    let mut admin = fx.hub.guard_route(Route::privileged("/admin"));
    let decision = within("admin decision", admin.wait_until(settled)).await?;
    assert_eq!(decision, Some(GuardDecision::Forbidden { redirect: "/".into() }));

    let mut upload = fx.hub.guard_route(Route::protected("/upload"));
    assert_eq!(within("upload decision", upload.wait_until(settled)).await?, Some(GuardDecision::Granted));
    Ok(())
}

#[tokio::test]
async fn admin_route_never_flickers_to_forbidden_while_resolving() -> Result<()> {
    let fx = Fixture::new("guard-flicker").await?;
    fx.settled().await?;

    let mut watch = fx.hub.guard_route(Route::privileged("/admin"));
    let mut seen = vec![watch.decision()];
    fx.hub.session.sign_in(ADMIN_EMAIL, PASSWORD).await?;

    while seen.last() != Some(&GuardDecision::Granted) {
        match within("next decision", watch.changed()).await? {
            Some(decision) => seen.push(decision),
            None => anyhow::bail!("guard stopped before granting: {:?}", seen),
        }
    }
    assert!(
        !seen.iter().any(|d| matches!(d, GuardDecision::Forbidden { .. })),
        "decisions went through Forbidden: {:?}",
        seen
    );
    Ok(())
}

#[tokio::test]
async fn sign_out_in_second_tab_redirects_mounted_guard() -> Result<()> {
    let fx = Fixture::new("guard-tab-a").await?;
    fx.sign_in_as(ADMIN_EMAIL).await?;

    let mut watch = fx.hub.guard_route(Route::privileged("/admin"));
    assert_eq!(within("granted", watch.wait_until(settled)).await?, Some(GuardDecision::Granted));

    let second_tab = fx.open_tab("guard-tab-b").await;
    within("second tab restore", second_tab.settled()).await?;
    assert_eq!(second_tab.session.sign_out().await, apphaven_hub::session::SignOutOutcome::Completed);

    let decision = within(
        "redirect after remote sign-out",
        watch.wait_until(|d| matches!(d, GuardDecision::Unauthenticated { .. })),
    )
    .await?;
    assert_eq!(
        decision,
        Some(GuardDecision::Unauthenticated { redirect: "/auth".into(), return_to: "/admin".into() })
    );
    second_tab.shutdown();
    Ok(())
}
