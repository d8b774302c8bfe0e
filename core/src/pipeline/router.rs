//! Routing tables mapping remote streams to sessions.
//!
//! The primary key is the stream source id. A secondary CNAME table,
//! populated from RTCP SDES, lets the group recognize a sender whose SSRC
//! changed (collision or restart) and relocate its session instead of
//! creating a fresh one.

use std::collections::HashMap;

use tracing::debug;

use crate::packet::StreamSource;

/// Stable index of a session inside its group's arena.
pub type SessionId = usize;

#[derive(Debug, Default)]
struct Route {
    source_id: StreamSource,
    cname: Option<String>,
}

/// Outcome of learning a CNAME for a source id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CnameOutcome {
    /// Nothing changed.
    Noop,
    /// The CNAME was attached to the session already owning this SSRC.
    Bound(SessionId),
    /// An existing session with this CNAME was rebound to a new SSRC.
    Relocated {
        /// The session that moved.
        session: SessionId,
        /// The SSRC it was previously keyed under.
        old_source_id: StreamSource,
    },
}

/// SSRC and CNAME lookup tables for one session group.
#[derive(Debug, Default)]
pub struct SessionRouter {
    by_source: HashMap<StreamSource, SessionId>,
    by_cname: HashMap<String, SessionId>,
    routes: HashMap<SessionId, Route>,
}

impl SessionRouter {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the session owning a source id.
    pub fn find_by_source(&self, source_id: StreamSource) -> Option<SessionId> {
        self.by_source.get(&source_id).copied()
    }

    /// Looks up the session owning a CNAME.
    pub fn find_by_cname(&self, cname: &str) -> Option<SessionId> {
        self.by_cname.get(cname).copied()
    }

    /// Registers a freshly created session.
    pub fn add_session(&mut self, session: SessionId, source_id: StreamSource) {
        self.by_source.insert(source_id, session);
        self.routes.insert(
            session,
            Route {
                source_id,
                cname: None,
            },
        );
    }

    /// Removes a session from all tables.
    pub fn remove_session(&mut self, session: SessionId) {
        if let Some(route) = self.routes.remove(&session) {
            self.by_source.remove(&route.source_id);
            if let Some(cname) = route.cname {
                self.by_cname.remove(&cname);
            }
        }
    }

    /// Records that `source_id` uses `cname`.
    ///
    /// When the CNAME is already bound to a session keyed under a different
    /// SSRC and the new SSRC has no session of its own, the old session is
    /// relocated to the new SSRC (same participant, new stream identity).
    pub fn learn_cname(&mut self, source_id: StreamSource, cname: &str) -> CnameOutcome {
        if let Some(&session) = self.by_source.get(&source_id) {
            let route = self.routes.get_mut(&session).expect("route exists");
            if route.cname.as_deref() == Some(cname) {
                return CnameOutcome::Noop;
            }
            if let Some(old) = route.cname.replace(cname.to_string()) {
                self.by_cname.remove(&old);
            }
            self.by_cname.insert(cname.to_string(), session);
            return CnameOutcome::Bound(session);
        }

        if let Some(&session) = self.by_cname.get(cname) {
            let route = self.routes.get_mut(&session).expect("route exists");
            let old_source_id = route.source_id;
            debug!(
                cname,
                old_source_id, source_id, "router: relocating session to new ssrc"
            );
            self.by_source.remove(&old_source_id);
            self.by_source.insert(source_id, session);
            route.source_id = source_id;
            return CnameOutcome::Relocated {
                session,
                old_source_id,
            };
        }

        CnameOutcome::Noop
    }

    /// Number of routed sessions.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no session is routed.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_lookup() {
        let mut router = SessionRouter::new();
        router.add_session(3, 0xaaaa);
        assert_eq!(router.find_by_source(0xaaaa), Some(3));
        assert_eq!(router.find_by_source(0xbbbb), None);
        router.remove_session(3);
        assert_eq!(router.find_by_source(0xaaaa), None);
    }

    #[test]
    fn test_cname_binds_to_existing_session() {
        let mut router = SessionRouter::new();
        router.add_session(1, 0xaaaa);
        assert_eq!(router.learn_cname(0xaaaa, "alice"), CnameOutcome::Bound(1));
        assert_eq!(router.find_by_cname("alice"), Some(1));
        // Learning the same pair again is a no-op.
        assert_eq!(router.learn_cname(0xaaaa, "alice"), CnameOutcome::Noop);
    }

    #[test]
    fn test_cname_relocates_on_ssrc_change() {
        let mut router = SessionRouter::new();
        router.add_session(1, 0xaaaa);
        router.learn_cname(0xaaaa, "alice");

        // Same participant reappears under a new SSRC.
        assert_eq!(
            router.learn_cname(0xcccc, "alice"),
            CnameOutcome::Relocated {
                session: 1,
                old_source_id: 0xaaaa
            }
        );
        assert_eq!(router.find_by_source(0xcccc), Some(1));
        assert_eq!(router.find_by_source(0xaaaa), None);
    }

    #[test]
    fn test_unknown_cname_is_noop() {
        let mut router = SessionRouter::new();
        assert_eq!(router.learn_cname(0xdddd, "nobody"), CnameOutcome::Noop);
    }

    #[test]
    fn test_remove_clears_cname_table() {
        let mut router = SessionRouter::new();
        router.add_session(1, 0xaaaa);
        router.learn_cname(0xaaaa, "alice");
        router.remove_session(1);
        assert_eq!(router.find_by_cname("alice"), None);
        assert!(router.is_empty());
    }
}
