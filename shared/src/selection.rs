//! Context-menu and multi-select state.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::CompressionDialog;
use crate::error::ValidationError;
use crate::model::{FileItem, Item, ItemId, ItemKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileAction {
    Open,
    Rename,
    Compress,
    Download,
    Delete,
    ToggleFavorite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FolderAction {
    Open,
    Rename,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MenuCommand {
    File(FileAction),
    Folder(FolderAction),
}

impl MenuCommand {
    /// Entries of the context menu for `item`. Compressed variants are not
    /// offered for compression again.
    pub fn available_for(item: &Item) -> Vec<MenuCommand> {
        match item {
            Item::File(file) => {
                let mut actions = vec![
                    FileAction::Open,
                    FileAction::Download,
                    FileAction::ToggleFavorite,
                    FileAction::Rename,
                ];
                if !file.is_compressed_variant() {
                    actions.push(FileAction::Compress);
                }
                actions.push(FileAction::Delete);
                actions.into_iter().map(MenuCommand::File).collect()
            }
            Item::Folder(_) => [FolderAction::Open, FolderAction::Rename, FolderAction::Delete]
                .into_iter()
                .map(MenuCommand::Folder)
                .collect(),
        }
    }

    pub fn target_kind(&self) -> ItemKind {
        match self {
            MenuCommand::File(_) => ItemKind::File,
            MenuCommand::Folder(_) => ItemKind::Folder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionState {
    #[default]
    Idle,
    ContextMenuOpen {
        item_id: ItemId,
        kind: ItemKind,
    },
    /// Ids in the order they were picked. Never empty.
    MultiSelectActive { item_ids: Vec<ItemId> },
}

impl SelectionState {
    pub fn state_name(&self) -> &'static str {
        match self {
            SelectionState::Idle => "idle",
            SelectionState::ContextMenuOpen { .. } => "context_menu_open",
            SelectionState::MultiSelectActive { .. } => "multi_select_active",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SelectionMachine {
    state: SelectionState,
}

impl SelectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SelectionState {
        &self.state
    }

    pub fn selected_ids(&self) -> &[ItemId] {
        match &self.state {
            SelectionState::MultiSelectActive { item_ids } => item_ids,
            _ => &[],
        }
    }

    pub fn is_selected(&self, id: &ItemId) -> bool {
        self.selected_ids().contains(id)
    }

    /// Replaces whatever was open, including a multi-selection.
    pub fn open_menu(&mut self, item: &Item) {
        self.state = SelectionState::ContextMenuOpen {
            item_id: item.id().clone(),
            kind: item.kind(),
        };
    }

    pub fn close_menu(&mut self) {
        if matches!(self.state, SelectionState::ContextMenuOpen { .. }) {
            self.state = SelectionState::Idle;
        }
    }

    /// The item the open menu belongs to.
    pub fn menu_target(&self) -> Option<(&ItemId, ItemKind)> {
        match &self.state {
            SelectionState::ContextMenuOpen { item_id, kind } => Some((item_id, *kind)),
            _ => None,
        }
    }

    /// Adds or removes `file`. Removing the last file returns to `Idle`.
    pub fn toggle(&mut self, file: &FileItem) -> Result<(), ValidationError> {
        if file.is_compressed_variant() {
            return Err(ValidationError::Selection(
                "compressed files cannot be selected".to_string(),
            ));
        }
        match &mut self.state {
            SelectionState::ContextMenuOpen { .. } => Err(ValidationError::Selection(
                "close the menu before selecting files".to_string(),
            )),
            SelectionState::Idle => {
                self.state = SelectionState::MultiSelectActive {
                    item_ids: vec![file.id.clone()],
                };
                Ok(())
            }
            SelectionState::MultiSelectActive { item_ids } => {
                match item_ids.iter().position(|id| id == &file.id) {
                    Some(index) => {
                        item_ids.remove(index);
                    }
                    None => item_ids.push(file.id.clone()),
                }
                if item_ids.is_empty() {
                    self.state = SelectionState::Idle;
                }
                debug!(selected = self.selected_ids().len(), "selection toggled");
                Ok(())
            }
        }
    }

    pub fn clear(&mut self) {
        self.state = SelectionState::Idle;
    }

    /// Drops ids that are no longer on screen.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&ItemId) -> bool) {
        let emptied = match &mut self.state {
            SelectionState::MultiSelectActive { item_ids } => {
                item_ids.retain(|id| keep(id));
                item_ids.is_empty()
            }
            SelectionState::ContextMenuOpen { item_id, .. } => !keep(item_id),
            SelectionState::Idle => false,
        };
        if emptied {
            self.state = SelectionState::Idle;
        }
    }

    /// Settings panel for the current multi-selection. `files` resolves ids
    /// to the items on screen.
    pub fn batch_dialog(&self, files: &[FileItem]) -> Result<CompressionDialog, ValidationError> {
        let ids = self.selected_ids();
        if ids.is_empty() {
            return Err(ValidationError::Selection(
                "select at least one file to compress".to_string(),
            ));
        }
        let kinds = ids
            .iter()
            .map(|id| {
                files
                    .iter()
                    .find(|f| &f.id == id)
                    .map(FileItem::media_kind)
                    .ok_or_else(|| ValidationError::UnknownItem(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        CompressionDialog::for_kinds(kinds).ok_or_else(|| {
            ValidationError::Selection("select at least one file to compress".to_string())
        })
    }
}
