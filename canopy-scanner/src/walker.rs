use crate::browser::DomDriver;
use crate::error::Result;
use crate::fetcher::RetryPolicy;
use crate::taxon::{Entity, FamilyRecord, OrderRecord, TaxonLink, absolute_url, taxon_id_from_href};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type WalkProgressCallback = Arc<dyn Fn(usize, usize, String) + Send + Sync>;

/// Class marking a node displayed in the inactive/extinct category.
const INACTIVE_CLASS: &str = "hidable";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rank {
    Order,
    Family,
}

impl Rank {
    pub fn css_class(&self) -> &'static str {
        match self {
            Rank::Order => "order",
            Rank::Family => "family",
        }
    }

    /// Words the site puts in front of (or after) a taxon name.
    fn labels(&self) -> &'static [&'static str] {
        match self {
            Rank::Order => &["Order", "Ordre"],
            Rank::Family => &["Family", "Famille"],
        }
    }
}

/// Lifecycle of one tree node during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    NotVisited,
    TabActivationPending,
    ChildrenExtracted(Vec<TaxonLink>),
}

impl NodeState {
    pub fn label(&self) -> &'static str {
        match self {
            NodeState::NotVisited => "not visited",
            NodeState::TabActivationPending => "tab activation pending",
            NodeState::ChildrenExtracted(_) => "children extracted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalkPolicy {
    pub tab_selector: String,
    pub container_selector: String,
    pub tab_timeout: Duration,
    pub navigation_retry: RetryPolicy,
}

impl Default for WalkPolicy {
    fn default() -> Self {
        Self {
            tab_selector: "a[href='#taxonomy-tab']".to_string(),
            container_selector: "#taxonomy-tab".to_string(),
            tab_timeout: Duration::from_secs(15),
            navigation_retry: RetryPolicy::default(),
        }
    }
}

/// Bounds for the lazy-loading grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPolicy {
    pub settle: Duration,
    pub max_stuck: u32,
    pub max_scrolls: u32,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(3500),
            max_stuck: 3,
            max_scrolls: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollStop {
    /// Height unchanged for `max_stuck` consecutive checks.
    Stable,
    /// `max_scrolls` reached first.
    CeilingReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollReport {
    pub scrolls: u32,
    pub final_height: i64,
    pub stop: ScrollStop,
}

/// Scroll until the page stops growing, or until the safety ceiling.
///
/// Every scroll action counts toward `max_scrolls`, whether or not the page
/// grew, so the loop runs at most `max_scrolls` times.
pub async fn scroll_until_stable<D: DomDriver + ?Sized>(
    driver: &mut D,
    policy: &ScrollPolicy,
) -> Result<ScrollReport> {
    let mut last_height = driver.page_height().await?;
    let mut scrolls = 0;
    let mut stuck = 0;

    while scrolls < policy.max_scrolls {
        driver.scroll_to_bottom().await?;
        scrolls += 1;
        tokio::time::sleep(policy.settle).await;

        let height = driver.page_height().await?;
        if height == last_height {
            stuck += 1;
            if stuck >= policy.max_stuck {
                debug!("Page stable at height {} after {} scrolls", height, scrolls);
                return Ok(ScrollReport {
                    scrolls,
                    final_height: height,
                    stop: ScrollStop::Stable,
                });
            }
        } else {
            stuck = 0;
            last_height = height;
        }
    }

    warn!("Scroll ceiling of {} reached", policy.max_scrolls);
    Ok(ScrollReport {
        scrolls,
        final_height: last_height,
        stop: ScrollStop::CeilingReached,
    })
}

/// Discovers orders, families and species by rendering pages.
pub struct HierarchyWalker<D: DomDriver> {
    driver: D,
    base_url: String,
    policy: WalkPolicy,
    scroll: ScrollPolicy,
    excluded_ids: Vec<String>,
    progress_callback: Option<WalkProgressCallback>,
}

impl<D: DomDriver> HierarchyWalker<D> {
    pub fn new(driver: D, base_url: impl Into<String>) -> Self {
        Self {
            driver,
            base_url: base_url.into(),
            policy: WalkPolicy::default(),
            scroll: ScrollPolicy::default(),
            excluded_ids: Vec::new(),
            progress_callback: None,
        }
    }

    pub fn with_policy(mut self, policy: WalkPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scroll_policy(mut self, scroll: ScrollPolicy) -> Self {
        self.scroll = scroll;
        self
    }

    /// Ids never returned as species (the roots the grid sometimes echoes).
    pub fn with_excluded_ids(mut self, ids: Vec<String>) -> Self {
        self.excluded_ids = ids;
        self
    }

    pub fn with_progress_callback(mut self, callback: WalkProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub async fn close(mut self) {
        self.driver.close().await;
    }

    fn report(&self, done: usize, total: usize, label: &str) {
        if let Some(ref callback) = self.progress_callback {
            callback(done, total, label.to_string());
        }
    }

    async fn navigate_with_retry(&mut self, url: &str) -> bool {
        let schedule = self.policy.navigation_retry.schedule().to_vec();
        for (attempt, wait) in schedule.iter().enumerate() {
            if !wait.is_zero() {
                tokio::time::sleep(*wait).await;
            }
            match self.driver.navigate(url).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Navigation attempt {} to {} failed: {}", attempt + 1, url, e);
                    if !self.driver.is_alive().await
                        && let Err(e) = self.driver.restart().await
                    {
                        warn!("Browser restart failed: {}", e);
                    }
                }
            }
        }
        false
    }

    /// Walk one node through NotVisited -> TabActivationPending ->
    /// ChildrenExtracted. Any failure on the way yields no children.
    pub async fn expand_node(&mut self, url: &str, rank: Rank) -> Vec<TaxonLink> {
        let mut state = NodeState::NotVisited;
        loop {
            debug!("{} {}", url, state.label());
            state = match state {
                NodeState::NotVisited => {
                    if !self.activate_tab(url).await {
                        return Vec::new();
                    }
                    NodeState::TabActivationPending
                }
                NodeState::TabActivationPending => match self.read_children(url, rank).await {
                    Some(children) => NodeState::ChildrenExtracted(children),
                    None => return Vec::new(),
                },
                NodeState::ChildrenExtracted(children) => return children,
            };
        }
    }

    /// Load the node page and trigger its taxonomy tab control.
    async fn activate_tab(&mut self, url: &str) -> bool {
        if !self.navigate_with_retry(url).await {
            warn!("Could not load {}, treating as childless", url);
            return false;
        }

        match self.driver.click(&self.policy.tab_selector).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("No taxonomy tab on {}", url);
                false
            }
            Err(e) => {
                warn!("Taxonomy tab activation failed on {}: {}", url, e);
                false
            }
        }
    }

    /// Poll for the child container and parse the links inside it.
    async fn read_children(&mut self, url: &str, rank: Rank) -> Option<Vec<TaxonLink>> {
        let container = self.policy.container_selector.clone();
        match self.driver.wait_for(&container, self.policy.tab_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Taxonomy container never appeared on {}", url);
                return None;
            }
            Err(e) => {
                warn!("Waiting for taxonomy container on {} failed: {}", url, e);
                return None;
            }
        }

        match self.driver.content().await {
            Ok(html) => Some(parse_taxonomy_children(&html, &container, rank)),
            Err(e) => {
                warn!("Could not read {}: {}", url, e);
                None
            }
        }
    }

    pub async fn discover_orders(&mut self, root_url: &str) -> Vec<OrderRecord> {
        info!("Discovering orders from {}", root_url);
        let links = self.expand_node(root_url, Rank::Order).await;

        let mut orders: Vec<OrderRecord> = links
            .into_iter()
            .map(|link| OrderRecord {
                url: absolute_url(&self.base_url, &link.href),
                id: link.id,
                name: link.name,
            })
            .collect();
        orders.sort_by(|a, b| a.name.cmp(&b.name));

        info!("{} active orders found", orders.len());
        orders
    }

    pub async fn discover_families(&mut self, orders: &[OrderRecord]) -> Vec<FamilyRecord> {
        let mut families = Vec::new();
        let mut seen = HashSet::new();
        let total = orders.len();

        for (idx, order) in orders.iter().enumerate() {
            self.report(idx + 1, total, &order.name);
            let links = self.expand_node(&order.url, Rank::Family).await;
            info!("[{}/{}] {}: {} families", idx + 1, total, order.name, links.len());

            for link in links {
                if !seen.insert(link.id.clone()) {
                    continue;
                }
                families.push(FamilyRecord {
                    url: absolute_url(&self.base_url, &link.href),
                    id: link.id,
                    name: link.name,
                    order: order.name.clone(),
                });
            }
        }

        families
    }

    pub fn species_grid_url(&self, family_id: &str) -> String {
        format!(
            "{}/observations?view=species&taxon_id={}&place_id=any&verifiable=any",
            self.base_url.trim_end_matches('/'),
            family_id
        )
    }

    /// Species of one family, read from the lazily loaded grid view.
    pub async fn species_in_family(&mut self, family: &FamilyRecord) -> Vec<Entity> {
        let url = self.species_grid_url(&family.id);
        if !self.navigate_with_retry(&url).await {
            warn!("Could not load species grid for {}", family.name);
            return Vec::new();
        }

        let scroll = self.scroll;
        if let Err(e) = scroll_until_stable(&mut self.driver, &scroll).await {
            warn!("Scrolling grid for {} failed: {}", family.name, e);
        }

        let html = match self.driver.content().await {
            Ok(html) => html,
            Err(e) => {
                warn!("Could not read species grid for {}: {}", family.name, e);
                return Vec::new();
            }
        };

        parse_species_grid(&html, &self.base_url, &self.excluded_ids)
            .into_iter()
            .map(|mut entity| {
                entity.parent_family = family.name.clone();
                entity.parent_order = family.order.clone();
                entity
            })
            .collect()
    }

    pub async fn discover_species(&mut self, families: &[FamilyRecord]) -> Vec<Entity> {
        let mut inventory = Vec::new();
        let mut seen = HashSet::new();
        let total = families.len();

        for (idx, family) in families.iter().enumerate() {
            self.report(idx + 1, total, &family.name);
            let species = self.species_in_family(family).await;
            info!("[{}/{}] {}: {} species", idx + 1, total, family.name, species.len());

            for entity in species {
                if seen.insert(entity.id.clone()) {
                    inventory.push(entity);
                }
            }
        }

        inventory
    }
}

fn has_class(element: &ElementRef, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Whether the element sits in the inactive/extinct display category: the
/// element itself or its nearest enclosing `li` carries the marker class.
pub fn is_inactive(element: &ElementRef) -> bool {
    if has_class(element, INACTIVE_CLASS) {
        return true;
    }
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "li")
        .is_some_and(|li| has_class(&li, INACTIVE_CLASS))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_rank_label(raw: &str, rank: Rank) -> String {
    raw.split_whitespace()
        .filter(|word| !rank.labels().contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of an element with any `span.rank` labels left out.
pub fn text_without_rank(element: &ElementRef) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let in_rank_label = node
            .ancestors()
            .take_while(|ancestor| ancestor.id() != element.id())
            .filter_map(ElementRef::wrap)
            .any(|ancestor| ancestor.value().name() == "span" && has_class(&ancestor, "rank"));
        if !in_rank_label {
            out.push_str(text);
            out.push(' ');
        }
    }
    collapse_whitespace(&out)
}

/// Active children of the given rank inside the taxonomy container,
/// de-duplicated by taxon id (first occurrence wins).
pub fn parse_taxonomy_children(html: &str, container_selector: &str, rank: Rank) -> Vec<TaxonLink> {
    let document = Html::parse_document(html);
    let Ok(container_sel) = Selector::parse(container_selector) else {
        warn!("Invalid container selector '{}'", container_selector);
        return Vec::new();
    };
    let node_sel = Selector::parse(&format!("span.taxon.{}", rank.css_class())).unwrap();
    let sciname_sel = Selector::parse("a.sciname").unwrap();
    let any_link_sel = Selector::parse("a[href]").unwrap();

    let Some(container) = document.select(&container_sel).next() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut children = Vec::new();

    for node in container.select(&node_sel) {
        if is_inactive(&node) {
            debug!("Skipping inactive {} node", rank.css_class());
            continue;
        }

        let Some(link) = node
            .select(&sciname_sel)
            .next()
            .or_else(|| node.select(&any_link_sel).next())
        else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(id) = taxon_id_from_href(href) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let raw_name = link.text().collect::<String>();
        children.push(TaxonLink {
            id,
            name: strip_rank_label(&raw_name, rank),
            href: href.to_string(),
        });
    }

    children
}

/// Species cards of the grid view, de-duplicated by id.
pub fn parse_species_grid(html: &str, base_url: &str, excluded_ids: &[String]) -> Vec<Entity> {
    let document = Html::parse_document(html);
    let cell_sel = Selector::parse("div.taxon-grid-cell").unwrap();
    let caption_sel = Selector::parse("div.caption").unwrap();
    let display_sel = Selector::parse("a.display-name").unwrap();
    let secondary_sel = Selector::parse("a.secondary-name").unwrap();

    let mut seen = HashSet::new();
    let mut species = Vec::new();

    for cell in document.select(&cell_sel) {
        if is_inactive(&cell) {
            continue;
        }
        let Some(caption) = cell.select(&caption_sel).next() else {
            continue;
        };

        let display = caption.select(&display_sel).next();
        let secondary = caption.select(&secondary_sel).next();
        let Some(main) = display.or(secondary) else {
            continue;
        };
        let Some(href) = main.value().attr("href") else {
            continue;
        };
        let Some(id) = taxon_id_from_href(href) else {
            continue;
        };
        if excluded_ids.contains(&id) || !seen.insert(id.clone()) {
            continue;
        }

        let common = display.map(|el| text_without_rank(&el)).unwrap_or_default();
        let scientific = secondary.map(|el| text_without_rank(&el)).unwrap_or_default();
        let name = if common.is_empty() {
            scientific.clone()
        } else {
            common
        };

        species.push(Entity {
            id,
            name,
            scientific_name: scientific,
            parent_family: String::new(),
            parent_order: String::new(),
            detail_url: absolute_url(base_url, href),
            api_image_url: None,
        });
    }

    species
}
