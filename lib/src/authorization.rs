// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Read/write authorization.
//!
//! An authorizer is resolved once per repository open by matching the
//! repository path against, in order: built-in enforced rules, user rules,
//! built-in optional rules. Root sessions and the local session bypass the
//! check at the call sites; trusted mode skips authorization entirely.

use std::sync::Arc;

use thiserror::Error;

use crate::doc_path::RepoId;
use crate::session::Session;

#[derive(Debug, Error)]
#[error("Unauthorized {op:?} on {repo}")]
pub struct UnauthorizedError {
    pub repo: RepoId,
    pub op: AuthOp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOp {
    Read,
    Write,
}

/// What a rule gets to look at.
pub struct AuthContext<'a> {
    pub repo: &'a RepoId,
    pub item_key: Option<&'a str>,
    pub session: &'a Session,
    pub op: AuthOp,
}

/// A single authorization callback.
pub type AuthRule = Arc<dyn Fn(&AuthContext<'_>) -> bool + Send + Sync>;

/// A user-supplied rule bound to a path pattern. Patterns are a repository
/// path (`/type/repo`) or a type-wide wildcard (`/type/*`).
#[derive(Clone)]
pub struct UserRule {
    pub pattern: String,
    pub rule: AuthRule,
}

impl UserRule {
    pub fn new(
        pattern: &str,
        rule: impl Fn(&AuthContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            pattern: pattern.to_owned(),
            rule: Arc::new(rule),
        }
    }
}

impl std::fmt::Debug for UserRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRule")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

fn pattern_matches(pattern: &str, repo: &RepoId) -> bool {
    let path = repo.to_string();
    if let Some(prefix) = pattern.strip_suffix("/*") {
        path.starts_with(&format!("{prefix}/")) || path == prefix
    } else {
        path == pattern
    }
}

/// The resolved authorizer for one repository.
#[derive(Clone)]
pub struct Authorizer {
    repo: RepoId,
    rule: Option<AuthRule>,
}

impl Authorizer {
    /// Resolves the rule chain for `repo`: built-in enforced rules, then
    /// the first matching `user_rules` entry, then built-in optional rules.
    pub fn resolve(repo: &RepoId, user_rules: &[UserRule]) -> Self {
        let rule = enforced_rule(repo)
            .or_else(|| {
                user_rules
                    .iter()
                    .find(|user| pattern_matches(&user.pattern, repo))
                    .map(|user| user.rule.clone())
            })
            .or_else(|| optional_rule(repo));
        Self {
            repo: repo.clone(),
            rule,
        }
    }

    /// A repository with no matching rule is open to every verified
    /// session.
    pub fn allows(&self, context: &AuthContext<'_>) -> bool {
        match &self.rule {
            Some(rule) => rule(context),
            None => true,
        }
    }

    pub fn check(&self, context: &AuthContext<'_>) -> Result<(), UnauthorizedError> {
        if self.allows(context) {
            Ok(())
        } else {
            Err(UnauthorizedError {
                repo: self.repo.clone(),
                op: context.op,
            })
        }
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("repo", &self.repo)
            .field("has_rule", &self.rule.is_some())
            .finish()
    }
}

fn enforced_rule(repo: &RepoId) -> Option<AuthRule> {
    if repo.is_sessions() {
        // Session records may be read by anyone but written only by roots.
        return Some(Arc::new(|context: &AuthContext<'_>| match context.op {
            AuthOp::Read => true,
            AuthOp::Write => context.session.is_root(),
        }));
    }
    if repo.kind() == "sys" && repo.name() == "stats" {
        return Some(Arc::new(|_: &AuthContext<'_>| false));
    }
    None
}

fn optional_rule(repo: &RepoId) -> Option<AuthRule> {
    if repo.kind() == "sys" {
        return Some(Arc::new(|context: &AuthContext<'_>| {
            context.session.is_root()
        }));
    }
    if repo.kind() == "user" {
        let owner = repo.name().to_owned();
        return Some(Arc::new(move |context: &AuthContext<'_>| {
            context.session.is_root() || context.session.owner.as_deref() == Some(&owner)
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OwnedSession;

    fn context<'a>(repo: &'a RepoId, session: &'a Session, op: AuthOp) -> AuthContext<'a> {
        AuthContext {
            repo,
            item_key: None,
            session,
            op,
        }
    }

    #[test]
    fn test_sessions_repo_is_read_only_for_non_root() {
        let repo = RepoId::sessions();
        let authorizer = Authorizer::resolve(&repo, &[]);
        let root = OwnedSession::generate_root();
        let anon = OwnedSession::generate(None);
        assert!(authorizer.allows(&context(&repo, anon.session(), AuthOp::Read)));
        assert!(!authorizer.allows(&context(&repo, anon.session(), AuthOp::Write)));
        assert!(authorizer.allows(&context(&repo, root.session(), AuthOp::Write)));
    }

    #[test]
    fn test_stats_repo_is_forbidden() {
        let repo = RepoId::from_parts("sys", "stats");
        let authorizer = Authorizer::resolve(&repo, &[]);
        let root = OwnedSession::generate_root();
        assert!(!authorizer.allows(&context(&repo, root.session(), AuthOp::Read)));
    }

    #[test]
    fn test_user_repos_are_owner_scoped() {
        let repo = RepoId::from_parts("user", "u1");
        let authorizer = Authorizer::resolve(&repo, &[]);
        let owner = OwnedSession::generate(Some("u1".to_owned()));
        let other = OwnedSession::generate(Some("u2".to_owned()));
        assert!(authorizer.allows(&context(&repo, owner.session(), AuthOp::Write)));
        assert!(!authorizer.allows(&context(&repo, other.session(), AuthOp::Read)));
    }

    #[test]
    fn test_user_rules_override_optional_builtins() {
        let repo = RepoId::from_parts("sys", "users");
        let rules = [UserRule::new("/sys/users", |_| true)];
        let authorizer = Authorizer::resolve(&repo, &rules);
        let anon = OwnedSession::generate(None);
        assert!(authorizer.allows(&context(&repo, anon.session(), AuthOp::Write)));
    }

    #[test]
    fn test_user_rules_cannot_override_enforced() {
        let repo = RepoId::sessions();
        let rules = [UserRule::new("/sys/*", |_| true)];
        let authorizer = Authorizer::resolve(&repo, &rules);
        let anon = OwnedSession::generate(None);
        assert!(!authorizer.allows(&context(&repo, anon.session(), AuthOp::Write)));
    }

    #[test]
    fn test_unmatched_repos_default_to_allow() {
        let repo = RepoId::from_parts("data", "tasks");
        let authorizer = Authorizer::resolve(&repo, &[]);
        let anon = OwnedSession::generate(None);
        assert!(authorizer.allows(&context(&repo, anon.session(), AuthOp::Write)));
    }
}
