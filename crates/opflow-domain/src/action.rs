use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of change planned for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    NoOp,
    Create,
    Read,
    Update,
    DeleteThenCreate,
    CreateThenDelete,
    Delete,
    Forget,
    Open,
    Renew,
    Close,
}

impl ChangeAction {
    pub const ALL: [ChangeAction; 11] = [
        ChangeAction::NoOp,
        ChangeAction::Create,
        ChangeAction::Read,
        ChangeAction::Update,
        ChangeAction::DeleteThenCreate,
        ChangeAction::CreateThenDelete,
        ChangeAction::Delete,
        ChangeAction::Forget,
        ChangeAction::Open,
        ChangeAction::Renew,
        ChangeAction::Close,
    ];

    pub fn is_replace(self) -> bool {
        matches!(
            self,
            ChangeAction::DeleteThenCreate | ChangeAction::CreateThenDelete
        )
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeAction::NoOp => "no-op",
            ChangeAction::Create => "create",
            ChangeAction::Read => "read",
            ChangeAction::Update => "update",
            ChangeAction::DeleteThenCreate => "replace (delete then create)",
            ChangeAction::CreateThenDelete => "replace (create then delete)",
            ChangeAction::Delete => "delete",
            ChangeAction::Forget => "forget",
            ChangeAction::Open => "open",
            ChangeAction::Renew => "renew",
            ChangeAction::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// The "higher-priority" action of two, used when aggregating a container's
/// child actions for diff display. Any create-or-delete beats `NoOp`; mixing
/// create and delete at the same level reads as an update; otherwise the
/// stronger of the two wins. Commutative.
pub fn combine(a: ChangeAction, b: ChangeAction) -> ChangeAction {
    use ChangeAction::*;
    match (a, b) {
        (NoOp, x) | (x, NoOp) => x,
        (Update, _) | (_, Update) => Update,
        _ if a.is_replace() && b.is_replace() => {
            // Mixed replacement shapes collapse to the default shape so the
            // result stays independent of argument order.
            if a == b {
                a
            } else {
                DeleteThenCreate
            }
        }
        _ if a.is_replace() => match b {
            Create => a,
            Delete => Delete,
            _ => Update,
        },
        _ if b.is_replace() => match a {
            Create => b,
            Delete => Delete,
            _ => Update,
        },
        (Create, Create) => Create,
        (Delete, Delete) => Delete,
        (Create, Delete) | (Delete, Create) => Update,
        (Read, Read) => Read,
        (Create, Read) | (Read, Create) | (Delete, Read) | (Read, Delete) => Update,
        _ if a == b => a,
        _ => Update,
    }
}

/// Reduce a tree level's child actions pairwise into the container's action.
pub fn combine_all(actions: impl IntoIterator<Item = ChangeAction>) -> ChangeAction {
    actions
        .into_iter()
        .fold(ChangeAction::NoOp, |acc, action| combine(acc, action))
}
