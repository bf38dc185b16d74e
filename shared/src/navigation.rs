use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;
use crate::model::{FolderId, FolderItem};

pub const ROOT_NAME: &str = "All Files";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// `None` for the synthetic root.
    pub id: Option<FolderId>,
    pub name: String,
}

impl Breadcrumb {
    pub fn root() -> Self {
        Self {
            id: None,
            name: ROOT_NAME.to_string(),
        }
    }
}

/// Breadcrumb stack. Never empty; the first entry is always the root and the
/// last one is the folder on screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationState {
    stack: Vec<Breadcrumb>,
}

impl Default for NavigationState {
    fn default() -> Self {
        Self::new()
    }
}

impl NavigationState {
    pub fn new() -> Self {
        Self {
            stack: vec![Breadcrumb::root()],
        }
    }

    pub fn current_folder_id(&self) -> Option<&FolderId> {
        self.stack.last().and_then(|crumb| crumb.id.as_ref())
    }

    pub fn breadcrumbs(&self) -> &[Breadcrumb] {
        &self.stack
    }

    /// Number of folders below the root.
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    pub fn is_at_root(&self) -> bool {
        self.stack.len() == 1
    }

    /// Descends into a child of the current folder.
    pub fn enter_folder(&mut self, folder: &FolderItem) -> Result<(), ValidationError> {
        if folder.parent_id.as_ref() != self.current_folder_id() {
            return Err(ValidationError::NotAChild {
                folder: folder.id.clone(),
            });
        }
        self.stack.push(Breadcrumb {
            id: Some(folder.id.clone()),
            name: folder.name.clone(),
        });
        debug!(folder_id = %folder.id, depth = self.depth(), "entered folder");
        Ok(())
    }

    /// Keeps breadcrumbs `0..=index`. Index 0 returns to the root.
    pub fn jump_to_breadcrumb(&mut self, index: usize) -> Result<(), ValidationError> {
        if index >= self.stack.len() {
            return Err(ValidationError::BreadcrumbOutOfRange {
                index,
                depth: self.stack.len(),
            });
        }
        self.stack.truncate(index + 1);
        Ok(())
    }

    /// Goes up one level. Returns `false` at the root.
    pub fn pop(&mut self) -> bool {
        if self.is_at_root() {
            return false;
        }
        self.stack.pop();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemId;
    use proptest::prelude::*;

    fn child(id: u64, parent: Option<u64>) -> FolderItem {
        FolderItem {
            id: ItemId::from(id),
            name: format!("folder-{id}"),
            parent_id: parent.map(ItemId::from),
            modified_at: None,
        }
    }

    #[test]
    fn test_starts_at_root() {
        let nav = NavigationState::new();
        assert_eq!(nav.current_folder_id(), None);
        assert_eq!(nav.breadcrumbs()[0].name, ROOT_NAME);
        assert_eq!(nav.depth(), 0);
    }

    #[test]
    fn test_enter_and_jump() {
        let mut nav = NavigationState::new();
        nav.enter_folder(&child(1, None)).unwrap();
        nav.enter_folder(&child(2, Some(1))).unwrap();
        assert_eq!(nav.current_folder_id(), Some(&ItemId::from(2)));

        nav.jump_to_breadcrumb(1).unwrap();
        assert_eq!(nav.current_folder_id(), Some(&ItemId::from(1)));

        nav.jump_to_breadcrumb(0).unwrap();
        assert_eq!(nav.current_folder_id(), None);
        assert_eq!(nav.breadcrumbs().len(), 1);
    }

    #[test]
    fn test_jump_out_of_range() {
        let mut nav = NavigationState::new();
        assert_eq!(
            nav.jump_to_breadcrumb(1),
            Err(ValidationError::BreadcrumbOutOfRange { index: 1, depth: 1 })
        );
    }

    #[test]
    fn test_enter_rejects_non_child() {
        let mut nav = NavigationState::new();
        assert!(matches!(
            nav.enter_folder(&child(5, Some(4))),
            Err(ValidationError::NotAChild { .. })
        ));
        assert!(nav.is_at_root());
    }

    #[test]
    fn test_pop_stops_at_root() {
        let mut nav = NavigationState::new();
        nav.enter_folder(&child(1, None)).unwrap();
        assert!(nav.pop());
        assert!(!nav.pop());
        assert_eq!(nav.current_folder_id(), None);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Enter,
        Jump(usize),
        Pop,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Enter),
            (0usize..8).prop_map(Step::Jump),
            Just(Step::Pop),
        ]
    }

    proptest! {
        #[test]
        fn stack_invariants_hold(steps in proptest::collection::vec(step(), 0..40)) {
            let mut nav = NavigationState::new();
            let mut next_id = 1u64;
            for step in steps {
                match step {
                    Step::Enter => {
                        let parent = nav.current_folder_id().cloned();
                        let folder = FolderItem {
                            id: ItemId::from(next_id),
                            name: format!("f{next_id}"),
                            parent_id: parent,
                            modified_at: None,
                        };
                        next_id += 1;
                        prop_assert!(nav.enter_folder(&folder).is_ok());
                    }
                    Step::Jump(index) => {
                        let len = nav.breadcrumbs().len();
                        let result = nav.jump_to_breadcrumb(index);
                        prop_assert_eq!(result.is_ok(), index < len);
                        if index < len {
                            prop_assert_eq!(nav.breadcrumbs().len(), index + 1);
                        }
                    }
                    Step::Pop => {
                        nav.pop();
                    }
                }
                prop_assert!(!nav.breadcrumbs().is_empty());
                prop_assert_eq!(nav.breadcrumbs()[0].id.as_ref(), None);
                prop_assert_eq!(
                    nav.current_folder_id(),
                    nav.breadcrumbs().last().and_then(|c| c.id.as_ref())
                );
            }
        }
    }
}
