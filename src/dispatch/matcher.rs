//! First-match-wins policy selection.
//!
//! Walks the cluster's ordered policy list and each policy's ordered rules;
//! the first rule hit selects the policy. Required dimensions (`verbs`,
//! `apiGroups`, `resources` for resource requests, `nonResourceURLs`
//! otherwise) match nothing when empty; optional dimensions constrain only
//! when non-empty. `"*"` is the wildcard everywhere.

use std::sync::Arc;

use crate::config::{DispatchPolicy, DispatchPolicyRule};
use crate::user::UserInfo;

use super::request_info::RequestInfo;

/// Pick the first policy whose rule list matches.
pub fn match_policy(
    policies: &[Arc<DispatchPolicy>],
    info: &RequestInfo,
    user: &UserInfo,
) -> Option<Arc<DispatchPolicy>> {
    policies
        .iter()
        .find(|policy| policy.rules.iter().any(|rule| rule_matches(rule, info, user)))
        .cloned()
}

/// Whether one rule covers the classified request and caller.
pub fn rule_matches(rule: &DispatchPolicyRule, info: &RequestInfo, user: &UserInfo) -> bool {
    if info.is_resource_request {
        if !contains(&rule.verbs, &info.verb) {
            return false;
        }
        if !contains(&rule.api_groups, &info.api_group) {
            return false;
        }
        if !resource_matches(&rule.resources, &info.resource, &info.subresource) {
            return false;
        }
        if !rule.resource_names.is_empty() && !contains(&rule.resource_names, &info.name) {
            return false;
        }
        if !rule.namespaces.is_empty() && !contains(&rule.namespaces, &info.namespace) {
            return false;
        }
    } else if !non_resource_url_matches(&rule.non_resource_urls, &info.path) {
        return false;
    }

    identity_matches(rule, user)
}

fn identity_matches(rule: &DispatchPolicyRule, user: &UserInfo) -> bool {
    if !rule.users.is_empty() && !contains(&rule.users, &user.username) {
        return false;
    }
    if !rule.user_groups.is_empty()
        && !rule
            .user_groups
            .iter()
            .any(|g| g == "*" || user.groups.iter().any(|ug| ug == g))
    {
        return false;
    }
    if !rule.service_accounts.is_empty() && !service_account_matches(rule, user) {
        return false;
    }
    true
}

/// Service account entries take the form `namespace/name`; either side may
/// be `"*"`. Non-service-account callers never match this dimension.
fn service_account_matches(rule: &DispatchPolicyRule, user: &UserInfo) -> bool {
    let Some((namespace, name)) = user.service_account_parts() else {
        return false;
    };
    rule.service_accounts.iter().any(|entry| {
        if entry == "*" {
            return true;
        }
        match entry.split_once('/') {
            Some((ns, n)) => (ns == "*" || ns == namespace) && (n == "*" || n == name),
            None => entry == name,
        }
    })
}

/// Literal-or-wildcard membership. Empty means no match.
fn contains(list: &[String], value: &str) -> bool {
    list.iter().any(|entry| entry == "*" || entry == value)
}

/// Resource entries support `resource`, `resource/subresource`, and
/// wildcards on either side of the slash.
fn resource_matches(list: &[String], resource: &str, subresource: &str) -> bool {
    if subresource.is_empty() {
        return contains(list, resource);
    }
    let combined = format!("{resource}/{subresource}");
    list.iter().any(|entry| {
        entry == "*"
            || entry == &combined
            || entry == &format!("{resource}/*")
            || entry == &format!("*/{subresource}")
    })
}

/// Non-resource entries match literally or with a trailing `/*` glob.
fn non_resource_url_matches(list: &[String], path: &str) -> bool {
    list.iter().any(|entry| {
        if entry == "*" {
            return true;
        }
        if let Some(prefix) = entry.strip_suffix("/*") {
            return path.starts_with(prefix)
                && path.len() > prefix.len()
                && path.as_bytes().get(prefix.len()) == Some(&b'/');
        }
        entry == path
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn resource_request(verb_method: &str, path: &str) -> RequestInfo {
        RequestInfo::parse(
            &verb_method.parse::<Method>().expect("method"),
            &path.parse().expect("uri"),
        )
    }

    fn wildcard_rule() -> DispatchPolicyRule {
        DispatchPolicyRule {
            verbs: vec!["*".into()],
            api_groups: vec!["*".into()],
            resources: vec!["*".into()],
            non_resource_urls: vec!["*".into()],
            ..Default::default()
        }
    }

    fn policy(name: &str, rules: Vec<DispatchPolicyRule>) -> Arc<DispatchPolicy> {
        Arc::new(DispatchPolicy {
            name: name.into(),
            rules,
            ..Default::default()
        })
    }

    #[test]
    fn first_match_wins_over_later_wildcards() {
        let get_only = policy(
            "get-only",
            vec![DispatchPolicyRule {
                verbs: vec!["get".into()],
                api_groups: vec!["*".into()],
                resources: vec!["*".into()],
                ..Default::default()
            }],
        );
        let catch_all = policy("catch-all", vec![wildcard_rule()]);
        let policies = vec![get_only, catch_all];
        let user = UserInfo::anonymous();

        let get = resource_request("GET", "/api/v1/namespaces/default/pods/web-0");
        assert_eq!(
            match_policy(&policies, &get, &user).expect("match").name,
            "get-only"
        );

        let delete = resource_request("DELETE", "/api/v1/namespaces/default/pods/web-0");
        assert_eq!(
            match_policy(&policies, &delete, &user).expect("match").name,
            "catch-all"
        );
    }

    #[test]
    fn empty_required_dimension_matches_nothing() {
        let rule = DispatchPolicyRule {
            api_groups: vec!["*".into()],
            resources: vec!["*".into()],
            ..Default::default()
        };
        let info = resource_request("GET", "/api/v1/pods");
        assert!(!rule_matches(&rule, &info, &UserInfo::anonymous()));
    }

    #[test]
    fn optional_dimensions_constrain_only_when_set() {
        let mut rule = wildcard_rule();
        let info = resource_request("GET", "/api/v1/namespaces/default/pods/web-0");
        let user = UserInfo::anonymous();
        assert!(rule_matches(&rule, &info, &user), "empty namespaces is unconstrained");

        rule.namespaces = vec!["kube-system".into()];
        assert!(!rule_matches(&rule, &info, &user));

        rule.namespaces = vec!["default".into()];
        assert!(rule_matches(&rule, &info, &user));

        rule.resource_names = vec!["other".into()];
        assert!(!rule_matches(&rule, &info, &user));
        rule.resource_names = vec!["web-0".into()];
        assert!(rule_matches(&rule, &info, &user));
    }

    #[test]
    fn resource_subresource_syntax() {
        let base = DispatchPolicyRule {
            verbs: vec!["*".into()],
            api_groups: vec!["*".into()],
            ..Default::default()
        };
        let log = resource_request("GET", "/api/v1/namespaces/default/pods/web-0/log");
        let user = UserInfo::anonymous();

        for (resources, want) in [
            (vec!["pods/log".to_string()], true),
            (vec!["pods/*".to_string()], true),
            (vec!["*/log".to_string()], true),
            (vec!["*".to_string()], true),
            (vec!["pods".to_string()], false),
            (vec!["pods/exec".to_string()], false),
        ] {
            let rule = DispatchPolicyRule {
                resources,
                ..base.clone()
            };
            assert_eq!(rule_matches(&rule, &log, &user), want, "{:?}", rule.resources);
        }
    }

    #[test]
    fn non_resource_urls_with_trailing_glob() {
        let rule = DispatchPolicyRule {
            non_resource_urls: vec!["/healthz".into(), "/debug/*".into()],
            ..Default::default()
        };
        let user = UserInfo::anonymous();
        assert!(rule_matches(&rule, &resource_request("GET", "/healthz"), &user));
        assert!(rule_matches(&rule, &resource_request("GET", "/debug/pprof"), &user));
        assert!(!rule_matches(&rule, &resource_request("GET", "/debug"), &user));
        assert!(!rule_matches(&rule, &resource_request("GET", "/healthz/etcd"), &user));
        assert!(!rule_matches(&rule, &resource_request("GET", "/metrics"), &user));
    }

    #[test]
    fn identity_dimensions() {
        let mut rule = wildcard_rule();
        let info = resource_request("GET", "/api/v1/pods");

        let jane = UserInfo::authenticated("jane", "", vec!["ops".into()]);
        let sa = UserInfo::authenticated("system:serviceaccount:kube-system:builder", "", vec![]);

        rule.users = vec!["jane".into()];
        assert!(rule_matches(&rule, &info, &jane));
        assert!(!rule_matches(&rule, &info, &sa));

        rule.users.clear();
        rule.user_groups = vec!["ops".into()];
        assert!(rule_matches(&rule, &info, &jane));
        assert!(!rule_matches(&rule, &info, &sa));

        rule.user_groups.clear();
        rule.service_accounts = vec!["kube-system/builder".into()];
        assert!(rule_matches(&rule, &info, &sa));
        assert!(!rule_matches(&rule, &info, &jane));

        rule.service_accounts = vec!["kube-system/*".into()];
        assert!(rule_matches(&rule, &info, &sa));

        rule.service_accounts = vec!["other-ns/*".into()];
        assert!(!rule_matches(&rule, &info, &sa));
    }

    #[test]
    fn no_policies_means_no_match() {
        let info = resource_request("GET", "/api/v1/pods");
        assert!(match_policy(&[], &info, &UserInfo::anonymous()).is_none());
    }
}
