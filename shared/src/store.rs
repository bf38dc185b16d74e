//! The listing of the folder currently on screen.
//!
//! Item data is written only by the navigation refetch path and the two
//! coordinators (`pub(crate)` mutators). View preferences such as category
//! and sort order are public.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model::{FileItem, FolderId, FolderItem, Item, ItemId};

pub type SharedStore = Arc<RwLock<ItemCollectionStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    All,
    Favourites,
    Folders,
    Compressed,
}

impl Category {
    pub fn admits(&self, item: &Item) -> bool {
        match (self, item) {
            (Category::All, _) => true,
            (Category::Folders, Item::Folder(_)) => true,
            (Category::Favourites, Item::File(f)) => f.favorite,
            (Category::Compressed, Item::File(f)) => f.is_compressed_variant(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOption {
    /// Lower-cased extension, ascending. Folders have none and come first.
    Type,
    /// Newest first; unknown dates sort as oldest.
    #[default]
    Date,
    /// Largest first; unknown sizes sort as zero.
    Size,
}

/// Folders come first in listing order; only files are sorted. Stable, so
/// equal keys keep their listing order.
pub fn sort_items(items: &mut [Item], option: SortOption) {
    items.sort_by(|a, b| match (a.as_file(), b.as_file()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_files(a, b, option),
    });
}

fn compare_files(a: &FileItem, b: &FileItem, option: SortOption) -> Ordering {
    match option {
        SortOption::Type => a
            .extension()
            .unwrap_or_default()
            .cmp(&b.extension().unwrap_or_default()),
        SortOption::Date => {
            let modified = |f: &FileItem| f.modified_at.map_or(0, |t| t.0);
            modified(b).cmp(&modified(a))
        }
        SortOption::Size => b.size_bytes.unwrap_or(0).cmp(&a.size_bytes.unwrap_or(0)),
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SearchState {
    query: String,
    /// `None` until the backend answers for this query.
    results: Option<Vec<FileItem>>,
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreView {
    pub folder_id: Option<FolderId>,
    pub items: Vec<Item>,
    pub category: Category,
    pub sort: SortOption,
    pub search_query: Option<String>,
    pub loading: bool,
}

/// Where a removed item sat, so a failed delete can put it back.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RemovedItem {
    pub item: Item,
    folder_generation: u64,
    list_index: Option<usize>,
    search_index: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ItemCollectionStore {
    folder_id: Option<FolderId>,
    generation: u64,
    files: Vec<FileItem>,
    folders: Vec<FolderItem>,
    category: Category,
    sort: SortOption,
    search: Option<SearchState>,
    loading: bool,
}

impl ItemCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn folder_id(&self) -> Option<&FolderId> {
        self.folder_id.as_ref()
    }

    pub fn displays(&self, folder: Option<&FolderId>) -> bool {
        self.folder_id.as_ref() == folder
    }

    /// Bumped on every folder switch. Results tagged with an older value
    /// belong to a folder that is no longer shown.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn files(&self) -> &[FileItem] {
        &self.files
    }

    pub fn folders(&self) -> &[FolderItem] {
        &self.folders
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn sort(&self) -> SortOption {
        self.sort
    }

    pub fn set_category(&mut self, category: Category) {
        self.category = category;
    }

    pub fn set_sort(&mut self, sort: SortOption) {
        self.sort = sort;
    }

    pub fn search_query(&self) -> Option<&str> {
        self.search.as_ref().map(|s| s.query.as_str())
    }

    /// Folders then files, filtered by `category`, in listing order.
    pub fn by_category(&self, category: Category) -> Vec<Item> {
        self.folders
            .iter()
            .cloned()
            .map(Item::Folder)
            .chain(self.files.iter().cloned().map(Item::File))
            .filter(|item| category.admits(item))
            .collect()
    }

    /// Current category, then sorted. Folders stay ahead of files.
    pub fn sorted_by(&self, option: SortOption) -> Vec<Item> {
        let mut items = self.by_category(self.category);
        sort_items(&mut items, option);
        items
    }

    /// Search results replace the category view while a query is active.
    pub fn view(&self) -> StoreView {
        let items = match &self.search {
            Some(search) => search
                .results
                .iter()
                .flatten()
                .cloned()
                .map(Item::File)
                .collect(),
            None => self.sorted_by(self.sort),
        };
        StoreView {
            folder_id: self.folder_id.clone(),
            items,
            category: self.category,
            sort: self.sort,
            search_query: self.search_query().map(str::to_string),
            loading: self.loading || self.search.as_ref().is_some_and(|s| s.results.is_none()),
        }
    }

    /// Looks in the listing first, then in search results.
    pub fn find(&self, id: &ItemId) -> Option<Item> {
        self.folders
            .iter()
            .find(|f| &f.id == id)
            .cloned()
            .map(Item::Folder)
            .or_else(|| self.find_file(id).cloned().map(Item::File))
    }

    fn find_file(&self, id: &ItemId) -> Option<&FileItem> {
        self.files.iter().find(|f| &f.id == id).or_else(|| {
            self.search
                .as_ref()
                .and_then(|s| s.results.as_ref())
                .and_then(|results| results.iter().find(|f| &f.id == id))
        })
    }

    // ========================================================================
    // Listing lifecycle
    // ========================================================================

    /// Drops the current listing and search and starts loading `folder`.
    /// Returns the generation the fetched contents must carry.
    pub(crate) fn reset_for(&mut self, folder: Option<FolderId>) -> u64 {
        self.folder_id = folder;
        self.generation += 1;
        self.files.clear();
        self.folders.clear();
        self.search = None;
        self.loading = true;
        self.generation
    }

    /// Starts a refetch of the folder already shown, keeping its items.
    pub(crate) fn begin_reload(&mut self) -> u64 {
        self.generation += 1;
        self.loading = true;
        self.generation
    }

    /// Returns `false` and leaves the store untouched when `generation` is
    /// stale.
    pub(crate) fn replace_contents(
        &mut self,
        generation: u64,
        files: Vec<FileItem>,
        folders: Vec<FolderItem>,
    ) -> bool {
        if generation != self.generation {
            return false;
        }
        self.files = files;
        self.folders = folders;
        self.loading = false;
        true
    }

    pub(crate) fn finish_loading(&mut self, generation: u64) {
        if generation == self.generation {
            self.loading = false;
        }
    }

    pub(crate) fn begin_search(&mut self, query: String) {
        self.search = Some(SearchState {
            query,
            results: None,
        });
    }

    /// Discards results for a query that is no longer current.
    pub(crate) fn set_search_results(&mut self, query: &str, results: Vec<FileItem>) -> bool {
        match &mut self.search {
            Some(search) if search.query == query => {
                search.results = Some(results);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear_search(&mut self) -> bool {
        self.search.take().is_some()
    }

    // ========================================================================
    // Item mutation
    // ========================================================================

    pub(crate) fn insert_file(&mut self, file: FileItem) -> bool {
        if !self.displays(file.parent_id.as_ref()) {
            return false;
        }
        match self.files.iter_mut().find(|f| f.id == file.id) {
            Some(existing) => *existing = file,
            None => self.files.push(file),
        }
        true
    }

    pub(crate) fn insert_folder(&mut self, folder: FolderItem) -> bool {
        if !self.displays(folder.parent_id.as_ref()) {
            return false;
        }
        match self.folders.iter_mut().find(|f| f.id == folder.id) {
            Some(existing) => *existing = folder,
            None => self.folders.push(folder),
        }
        true
    }

    /// Overwrites every copy of the item. Returns `false` when nothing is
    /// shown under that id.
    pub(crate) fn replace_item(&mut self, item: Item) -> bool {
        let mut found = false;
        match item {
            Item::Folder(folder) => {
                for slot in self.folders.iter_mut().filter(|f| f.id == folder.id) {
                    *slot = folder.clone();
                    found = true;
                }
            }
            Item::File(file) => {
                let searched = self.search.as_mut().and_then(|s| s.results.as_mut());
                for slot in self
                    .files
                    .iter_mut()
                    .chain(searched.into_iter().flatten())
                    .filter(|f| f.id == file.id)
                {
                    *slot = file.clone();
                    found = true;
                }
            }
        }
        found
    }

    /// Returns the item as it was before the rename.
    pub(crate) fn apply_rename(&mut self, id: &ItemId, name: &str) -> Option<Item> {
        let previous = self.find(id)?;
        let mut renamed = previous.clone();
        match &mut renamed {
            Item::File(f) => f.name = name.to_string(),
            Item::Folder(f) => f.name = name.to_string(),
        }
        self.replace_item(renamed);
        Some(previous)
    }

    /// Returns the file as it was before the change.
    pub(crate) fn set_favorite(&mut self, id: &ItemId, favorite: bool) -> Option<FileItem> {
        let previous = self.find_file(id)?.clone();
        let mut updated = previous.clone();
        updated.favorite = favorite;
        self.replace_item(Item::File(updated));
        Some(previous)
    }

    pub(crate) fn remove(&mut self, id: &ItemId) -> Option<RemovedItem> {
        let item = self.find(id)?;
        let list_index = match &item {
            Item::Folder(_) => {
                let index = self.folders.iter().position(|f| &f.id == id);
                if let Some(i) = index {
                    self.folders.remove(i);
                }
                index
            }
            Item::File(_) => {
                let index = self.files.iter().position(|f| &f.id == id);
                if let Some(i) = index {
                    self.files.remove(i);
                }
                index
            }
        };
        let search_index = self
            .search
            .as_mut()
            .and_then(|s| s.results.as_mut())
            .and_then(|results| {
                let index = results.iter().position(|f| &f.id == id)?;
                results.remove(index);
                Some(index)
            });
        Some(RemovedItem {
            item,
            folder_generation: self.generation,
            list_index,
            search_index,
        })
    }

    /// Puts a removed item back where it was. A folder switch since the
    /// removal makes this a no-op.
    pub(crate) fn restore(&mut self, removed: RemovedItem) -> bool {
        if removed.folder_generation != self.generation || self.find(removed.item.id()).is_some() {
            return false;
        }
        let mut restored = false;
        match (removed.item, removed.list_index) {
            (Item::Folder(folder), Some(index)) => {
                let index = index.min(self.folders.len());
                self.folders.insert(index, folder);
                restored = true;
            }
            (Item::File(file), list_index) => {
                if let (Some(index), Some(results)) = (
                    removed.search_index,
                    self.search.as_mut().and_then(|s| s.results.as_mut()),
                ) {
                    let index = index.min(results.len());
                    results.insert(index, file.clone());
                    restored = true;
                }
                if let Some(index) = list_index {
                    let index = index.min(self.files.len());
                    self.files.insert(index, file);
                    restored = true;
                }
            }
            (Item::Folder(_), None) => {}
        }
        restored
    }
}
