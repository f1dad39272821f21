//! Route guard - the access decision made before any protected view renders

use crate::session::{Role, Session, SessionStore};
use std::fmt;

/// Outcome of a navigation check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Render,
    RedirectLogin,
    RedirectHome,
}

impl Decision {
    /// Where to navigate instead, if anywhere
    pub fn redirect_target(&self) -> Option<Route> {
        match self {
            Decision::Render => None,
            Decision::RedirectLogin => Some(Route::Login),
            Decision::RedirectHome => Some(Route::Dashboard),
        }
    }
}

/// Total over its inputs: no session means login, a role mismatch means home
pub fn decide(session: Option<&Session>, required_role: Option<Role>) -> Decision {
    match (session, required_role) {
        (None, _) => Decision::RedirectLogin,
        (Some(session), Some(role)) if session.role() != role => Decision::RedirectHome,
        _ => Decision::Render,
    }
}

/// Navigable views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Login,
    Register,
    Dashboard,
    GlobalDashboard,
    ReportThreat,
    Scan,
    Admin,
}

impl Route {
    pub const ALL: [Route; 7] = [
        Route::Login,
        Route::Register,
        Route::Dashboard,
        Route::GlobalDashboard,
        Route::ReportThreat,
        Route::Scan,
        Route::Admin,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Route::Login => "/login",
            Route::Register => "/register",
            Route::Dashboard => "/dashboard",
            Route::GlobalDashboard => "/global-dashboard",
            Route::ReportThreat => "/report-threat",
            Route::Scan => "/scan",
            Route::Admin => "/admin",
        }
    }

    pub fn from_path(path: &str) -> Option<Route> {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Some(Route::Login);
        }
        Self::ALL.into_iter().find(|r| r.path() == path)
    }

    /// Login and registration are reachable without a session
    pub fn is_protected(&self) -> bool {
        !matches!(self, Route::Login | Route::Register)
    }

    pub fn required_role(&self) -> Option<Role> {
        match self {
            Route::Admin => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Applies [`decide`] to the live session on every navigation attempt
#[derive(Debug, Clone)]
pub struct RouteGuard {
    session: SessionStore,
}

impl RouteGuard {
    pub fn new(session: SessionStore) -> Self {
        Self { session }
    }

    /// Reads the store on every call; nothing is cached between navigations
    pub fn check(&self, route: Route) -> Decision {
        if !route.is_protected() {
            return Decision::Render;
        }
        let session = self.session.get_session();
        let decision = decide(session.as_ref(), route.required_role());
        if decision != Decision::Render {
            tracing::debug!("Navigation to {} redirected: {:?}", route, decision);
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClearReason, User};

    fn store_with(role: Role) -> SessionStore {
        let store = SessionStore::in_memory();
        store
            .set_session("tok", User::new("u1", "Alice", role))
            .unwrap();
        store
    }

    #[test]
    fn test_decide_table() {
        let member = store_with(Role::Member).get_session();
        let admin = store_with(Role::Admin).get_session();

        assert_eq!(decide(None, Some(Role::Admin)), Decision::RedirectLogin);
        assert_eq!(decide(None, None), Decision::RedirectLogin);
        assert_eq!(
            decide(member.as_ref(), Some(Role::Admin)),
            Decision::RedirectHome
        );
        assert_eq!(decide(admin.as_ref(), Some(Role::Admin)), Decision::Render);
        assert_eq!(decide(member.as_ref(), None), Decision::Render);
        assert_eq!(
            decide(admin.as_ref(), Some(Role::Member)),
            Decision::RedirectHome
        );
    }

    #[test]
    fn test_redirect_targets() {
        assert_eq!(Decision::RedirectLogin.redirect_target(), Some(Route::Login));
        assert_eq!(Decision::RedirectHome.redirect_target(), Some(Route::Dashboard));
        assert_eq!(Decision::Render.redirect_target(), None);
    }

    #[test]
    fn test_guard_rereads_session_each_time() {
        let store = store_with(Role::Member);
        let guard = RouteGuard::new(store.clone());

        assert_eq!(guard.check(Route::Dashboard), Decision::Render);
        store.clear(ClearReason::Unauthorized);
        assert_eq!(guard.check(Route::Dashboard), Decision::RedirectLogin);
    }

    #[test]
    fn test_public_routes_always_render() {
        let guard = RouteGuard::new(SessionStore::in_memory());
        assert_eq!(guard.check(Route::Login), Decision::Render);
        assert_eq!(guard.check(Route::Register), Decision::Render);
        assert_eq!(guard.check(Route::Admin), Decision::RedirectLogin);
    }

    #[test]
    fn test_admin_route_for_member() {
        let guard = RouteGuard::new(store_with(Role::Member));
        assert_eq!(guard.check(Route::Admin), Decision::RedirectHome);
        assert_eq!(guard.check(Route::Scan), Decision::Render);
    }

    #[test]
    fn test_route_paths() {
        for route in Route::ALL {
            assert_eq!(Route::from_path(route.path()), Some(route));
        }
        assert_eq!(Route::from_path("/"), Some(Route::Login));
        assert_eq!(Route::from_path("/dashboard/"), Some(Route::Dashboard));
        assert_eq!(Route::from_path("/nope"), None);
    }
}
