//! Registry of UI components (widgets, pages, admin pages, menu items)
//! contributed by modules for the front end to render.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ExtError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Widget {
    pub id: String,
    pub title: String,
    /// Front-end component reference.
    pub component: String,
    /// Layout hint: `top`, `sidebar`, `bottom`...
    pub position: String,
    /// Layout hint: `full`, `half`, `third`...
    pub width: String,
    pub icon: Option<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub path: String,
    pub component: String,
    pub icon: Option<String>,
    pub menu_label: Option<String>,
    pub permissions: Vec<String>,
    /// Ordering within the admin navigation; ignored for user pages.
    pub order: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MenuItem {
    pub id: String,
    pub label: String,
    pub path: String,
    pub icon: Option<String>,
    pub component: Option<String>,
    pub order: i32,
    pub permissions: Vec<String>,
}

/// A registered component together with its owning module.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiEntry<T> {
    pub module: String,
    #[serde(flatten)]
    pub item: T,
}

/// Everything the front end needs to render module contributions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiManifest {
    pub widgets: Vec<UiEntry<Widget>>,
    pub admin_widgets: Vec<UiEntry<Widget>>,
    pub pages: Vec<UiEntry<Page>>,
    pub admin_pages: Vec<UiEntry<Page>>,
    pub menu_items: Vec<UiEntry<MenuItem>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiKind {
    Widget,
    AdminWidget,
    Page,
    AdminPage,
    MenuItem,
}

impl UiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UiKind::Widget => "widget",
            UiKind::AdminWidget => "admin widget",
            UiKind::Page => "page",
            UiKind::AdminPage => "admin page",
            UiKind::MenuItem => "menu item",
        }
    }
}

type Slot<T> = DashMap<(String, String), T>;

#[derive(Default)]
pub struct UiRegistry {
    widgets: Slot<Widget>,
    admin_widgets: Slot<Widget>,
    pages: Slot<Page>,
    admin_pages: Slot<Page>,
    menu_items: Slot<MenuItem>,
}

fn insert_unique<T>(slot: &Slot<T>, kind: UiKind, module: &str, id: &str, item: T) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ExtError::InvalidIdentifier(format!("{} id ''", kind.as_str())));
    }
    match slot.entry((module.to_string(), id.to_string())) {
        Entry::Occupied(_) => Err(ExtError::UiConflict {
            module: module.to_string(),
            kind: kind.as_str(),
            id: id.to_string(),
        }),
        Entry::Vacant(v) => {
            v.insert(item);
            tracing::debug!(module, kind = kind.as_str(), id, "ui component registered");
            Ok(())
        }
    }
}

fn remove_module<T>(slot: &Slot<T>, module: &str) -> usize {
    let mut removed = 0;
    slot.retain(|(m, _), _| {
        let keep = m != module;
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

fn collect<T: Clone>(slot: &Slot<T>, module: Option<&str>) -> Vec<UiEntry<T>> {
    slot.iter()
        .filter(|e| module.map_or(true, |m| e.key().0 == m))
        .map(|e| UiEntry {
            module: e.key().0.clone(),
            item: e.value().clone(),
        })
        .collect()
}

impl UiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_widget(&self, module: &str, widget: Widget) -> Result<()> {
        let id = widget.id.clone();
        insert_unique(&self.widgets, UiKind::Widget, module, &id, widget)
    }

    pub fn register_admin_widget(&self, module: &str, widget: Widget) -> Result<()> {
        let id = widget.id.clone();
        insert_unique(&self.admin_widgets, UiKind::AdminWidget, module, &id, widget)
    }

    pub fn register_page(&self, module: &str, page: Page) -> Result<()> {
        let id = page.id.clone();
        insert_unique(&self.pages, UiKind::Page, module, &id, page)
    }

    pub fn register_admin_page(&self, module: &str, page: Page) -> Result<()> {
        let id = page.id.clone();
        insert_unique(&self.admin_pages, UiKind::AdminPage, module, &id, page)
    }

    pub fn register_menu_item(&self, module: &str, item: MenuItem) -> Result<()> {
        let id = item.id.clone();
        insert_unique(&self.menu_items, UiKind::MenuItem, module, &id, item)
    }

    pub fn unregister(&self, module: &str, kind: UiKind, id: &str) -> bool {
        let key = (module.to_string(), id.to_string());
        match kind {
            UiKind::Widget => self.widgets.remove(&key).is_some(),
            UiKind::AdminWidget => self.admin_widgets.remove(&key).is_some(),
            UiKind::Page => self.pages.remove(&key).is_some(),
            UiKind::AdminPage => self.admin_pages.remove(&key).is_some(),
            UiKind::MenuItem => self.menu_items.remove(&key).is_some(),
        }
    }

    /// Scan every collection and drop `module`'s entries.
    pub fn unregister_all(&self, module: &str) -> usize {
        let removed = remove_module(&self.widgets, module)
            + remove_module(&self.admin_widgets, module)
            + remove_module(&self.pages, module)
            + remove_module(&self.admin_pages, module)
            + remove_module(&self.menu_items, module);
        if removed > 0 {
            tracing::debug!(module, removed, "ui components unregistered");
        }
        removed
    }

    pub fn widgets(&self) -> Vec<UiEntry<Widget>> {
        sorted_by_id(collect(&self.widgets, None))
    }

    pub fn admin_widgets(&self) -> Vec<UiEntry<Widget>> {
        sorted_by_id(collect(&self.admin_widgets, None))
    }

    pub fn pages(&self) -> Vec<UiEntry<Page>> {
        sorted_by_id(collect(&self.pages, None))
    }

    pub fn admin_pages(&self) -> Vec<UiEntry<Page>> {
        let mut v = collect(&self.admin_pages, None);
        v.sort_by(|a, b| (a.item.order, &a.module, &a.item.id).cmp(&(b.item.order, &b.module, &b.item.id)));
        v
    }

    pub fn menu_items(&self) -> Vec<UiEntry<MenuItem>> {
        let mut v = collect(&self.menu_items, None);
        v.sort_by(|a, b| (a.item.order, &a.module, &a.item.id).cmp(&(b.item.order, &b.module, &b.item.id)));
        v
    }

    pub fn manifest(&self) -> UiManifest {
        UiManifest {
            widgets: self.widgets(),
            admin_widgets: self.admin_widgets(),
            pages: self.pages(),
            admin_pages: self.admin_pages(),
            menu_items: self.menu_items(),
        }
    }

    /// Number of components `module` currently has registered, across all kinds.
    pub fn count_for(&self, module: &str) -> usize {
        collect(&self.widgets, Some(module)).len()
            + collect(&self.admin_widgets, Some(module)).len()
            + collect(&self.pages, Some(module)).len()
            + collect(&self.admin_pages, Some(module)).len()
            + collect(&self.menu_items, Some(module)).len()
    }
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for Widget {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Page {
    fn id(&self) -> &str {
        &self.id
    }
}

fn sorted_by_id<T: HasId>(mut v: Vec<UiEntry<T>>) -> Vec<UiEntry<T>> {
    v.sort_by(|a, b| (&a.module, a.item.id()).cmp(&(&b.module, b.item.id())));
    v
}

/// Per-module view of the UI registry.
#[derive(Clone)]
pub struct ModuleUi {
    module: Arc<str>,
    registry: Arc<UiRegistry>,
}

impl ModuleUi {
    pub(crate) fn new(module: Arc<str>, registry: Arc<UiRegistry>) -> Self {
        Self { module, registry }
    }

    pub fn widget(&self, widget: Widget) -> Result<()> {
        self.registry.register_widget(&self.module, widget)
    }

    pub fn admin_widget(&self, widget: Widget) -> Result<()> {
        self.registry.register_admin_widget(&self.module, widget)
    }

    pub fn page(&self, page: Page) -> Result<()> {
        self.registry.register_page(&self.module, page)
    }

    pub fn admin_page(&self, page: Page) -> Result<()> {
        self.registry.register_admin_page(&self.module, page)
    }

    pub fn menu_item(&self, item: MenuItem) -> Result<()> {
        self.registry.register_menu_item(&self.module, item)
    }

    pub fn unregister(&self, kind: UiKind, id: &str) -> bool {
        self.registry.unregister(&self.module, kind, id)
    }
}
