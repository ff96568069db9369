//! In-Memory Catalog Provider
//!
//! A small, self-contained capability provider backed by an explicit
//! `CatalogStore`. It stands in for the external search and catalog services
//! so the relay can run end to end in development and tests.

use crate::side_channel::{SideChannelEvent, SideChannelKind};
use crate::tools::{Tool, ToolContext, ToolError, ToolOutput, ToolRegistryBuilder};
use async_trait::async_trait;
use fuzzy_matcher::{FuzzyMatcher, skim::SkimMatcherV2};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Maximum number of related items pushed alongside a search.
const MAX_RECOMMENDATIONS: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub price: f64,
    pub description: String,
    pub stock: u32,
}

impl Product {
    fn new(
        id: &str,
        name: &str,
        brand: &str,
        category: &str,
        price: f64,
        description: &str,
        stock: u32,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            brand: brand.to_string(),
            category: category.to_string(),
            price,
            description: description.to_string(),
            stock,
        }
    }
}

/// Categories worth suggesting next to a given category.
fn related_categories(category: &str) -> &'static [&'static str] {
    match category {
        "power_tools" => &["hand_tools", "safety", "storage", "building_materials"],
        "hand_tools" => &["power_tools", "safety", "storage"],
        "paint" => &["hand_tools", "building_materials", "safety"],
        "plumbing" => &["hand_tools", "power_tools", "building_materials"],
        "electrical" => &["hand_tools", "safety", "lighting"],
        "flooring" => &[],
        "building_materials" => &["hand_tools", "power_tools", "paint"],
        "outdoor_garden" => &["power_tools", "hand_tools", "storage"],
        "kitchen_bath" => &["plumbing", "lighting"],
        _ => &["hand_tools"],
    }
}

/// Read-only product store shared by the catalog tools.
pub struct CatalogStore {
    products: Vec<Product>,
    matcher: SkimMatcherV2,
}

impl CatalogStore {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products,
            matcher: SkimMatcherV2::default(),
        }
    }

    /// A handful of home-improvement products for local development.
    pub fn demo() -> Self {
        Self::new(vec![
            Product::new("p-100", "20V Cordless Drill", "DeWalt", "power_tools", 129.0, "Compact drill/driver with two batteries", 42),
            Product::new("p-101", "Hammer Drill Kit", "Milwaukee", "power_tools", 199.0, "Brushless hammer drill for masonry", 12),
            Product::new("p-102", "Circular Saw", "Makita", "power_tools", 149.0, "7-1/4 inch circular saw", 20),
            Product::new("p-200", "Drill Bit Set", "Bosch", "hand_tools", 34.0, "Titanium drill bit set, 29 pieces", 80),
            Product::new("p-201", "Claw Hammer", "Estwing", "hand_tools", 29.0, "16 oz steel claw hammer", 65),
            Product::new("p-300", "Safety Glasses", "3M", "safety", 9.0, "Anti-fog safety glasses", 150),
            Product::new("p-301", "Work Gloves", "Carhartt", "safety", 19.0, "Insulated work gloves", 90),
            Product::new("p-400", "Tool Storage Box", "Husky", "storage", 49.0, "22 inch tool box", 33),
            Product::new("p-500", "Interior Paint, Eggshell", "Behr", "paint", 38.0, "One gallon interior paint and primer", 70),
            Product::new("p-501", "Paint Roller Kit", "Wooster", "hand_tools", 22.0, "Roller, tray and covers", 55),
            Product::new("p-600", "Kitchen Faucet", "Moen", "kitchen_bath", 189.0, "Pull-down kitchen faucet", 18),
            Product::new("p-601", "PEX Pipe, 100 ft", "SharkBite", "plumbing", 59.0, "1/2 inch PEX tubing", 25),
            Product::new("p-700", "LED Shop Light", "Lithonia", "lighting", 45.0, "4 ft linkable LED shop light", 40),
            Product::new("p-800", "Oak Hardwood Flooring", "Bruce", "flooring", 4.5, "Solid oak flooring, per sq ft", 5000),
        ])
    }

    pub fn get(&self, product_id: &str) -> Option<&Product> {
        self.products.iter().find(|p| p.id == product_id)
    }

    /// Fuzzy search over name, brand and category, best match first.
    pub fn search(&self, query: &SearchProductsArgs) -> Vec<Product> {
        let mut scored: Vec<(i64, &Product)> = self
            .products
            .iter()
            .filter(|p| query.category.as_deref().is_none_or(|c| p.category == c))
            .filter(|p| query.min_price.is_none_or(|min| p.price >= min))
            .filter(|p| query.max_price.is_none_or(|max| p.price <= max))
            .filter_map(|p| {
                let haystack = format!("{} {} {}", p.name, p.brand, p.category);
                self.matcher
                    .fuzzy_match(&haystack, &query.query)
                    .map(|score| (score, p))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored
            .into_iter()
            .take(query.limit.unwrap_or(5))
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Items from categories related to `category`, skipping `exclude`.
    pub fn related(&self, category: &str, exclude: &[Product]) -> Vec<Product> {
        let related = related_categories(category);
        self.products
            .iter()
            .filter(|p| related.contains(&p.category.as_str()))
            .filter(|p| exclude.iter().all(|e| e.id != p.id))
            .take(MAX_RECOMMENDATIONS)
            .cloned()
            .collect()
    }

    pub fn in_categories(&self, categories: &[&str], max_price: Option<f64>) -> Vec<Product> {
        self.products
            .iter()
            .filter(|p| categories.contains(&p.category.as_str()))
            .filter(|p| max_price.is_none_or(|max| p.price <= max))
            .cloned()
            .collect()
    }
}

/// Registers every catalog tool against one shared store.
pub fn register_catalog_tools(
    builder: ToolRegistryBuilder,
    store: Arc<CatalogStore>,
) -> ToolRegistryBuilder {
    builder
        .register(SearchProducts(store.clone()))
        .register(GetProductDetails(store.clone()))
        .register(GetProjectRecommendations(store.clone()))
        .register(AddToCart(store))
        .register(ViewCart)
        .register(RemoveFromCart)
        .register(ClearCart)
}

// --- Search ---

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct SearchProductsArgs {
    /// Search query - product name, category, or keywords.
    pub query: String,
    /// Optional category filter (e.g. 'power_tools', 'flooring', 'plumbing').
    #[serde(default)]
    pub category: Option<String>,
    /// Minimum price filter.
    #[serde(default)]
    pub min_price: Option<f64>,
    /// Maximum price filter.
    #[serde(default)]
    pub max_price: Option<f64>,
    /// Maximum number of results (default 5).
    #[serde(default)]
    pub limit: Option<usize>,
}

pub struct SearchProducts(pub Arc<CatalogStore>);

#[async_trait]
impl Tool for SearchProducts {
    type Args = SearchProductsArgs;

    fn name(&self) -> &'static str {
        "search_products"
    }

    fn description(&self) -> &'static str {
        "Search for products by name, category, keywords, or description. Use this when a customer is looking for a product or browsing a category."
    }

    async fn run(&self, _ctx: &ToolContext, args: SearchProductsArgs) -> Result<ToolOutput, ToolError> {
        if args.query.trim().is_empty() {
            return Err(ToolError::invalid_arguments("query must not be empty"));
        }
        let products = self.0.search(&args);
        info!(query = %args.query, hits = products.len(), "Product search");

        let summary = match products.first() {
            Some(top) => format!("Found {} products. Top match: {}.", products.len(), top.name),
            None => format!("No products matched '{}'.", args.query),
        };
        let result = json!({ "products": products, "count": products.len(), "summary": summary });

        let mut output = ToolOutput::new(result.clone()).with_side_effect(
            SideChannelEvent::from_tool(SideChannelKind::Products, self.name(), result),
        );
        if let Some(top) = products.first() {
            let related = self.0.related(&top.category, &products);
            if !related.is_empty() {
                output = output.with_side_effect(SideChannelEvent::from_tool(
                    SideChannelKind::Recommendation,
                    self.name(),
                    json!({ "based_on": top.id, "products": related }),
                ));
            }
        }
        Ok(output)
    }
}

// --- Details ---

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProductIdArgs {
    /// The unique product ID.
    pub product_id: String,
}

pub struct GetProductDetails(pub Arc<CatalogStore>);

#[async_trait]
impl Tool for GetProductDetails {
    type Args = ProductIdArgs;

    fn name(&self) -> &'static str {
        "get_product_details"
    }

    fn description(&self) -> &'static str {
        "Get detailed information about a specific product including specifications and availability."
    }

    async fn run(&self, _ctx: &ToolContext, args: ProductIdArgs) -> Result<ToolOutput, ToolError> {
        let result = match self.0.get(&args.product_id) {
            Some(product) => json!({ "found": true, "product": product, "in_stock": product.stock > 0 }),
            None => json!({ "found": false, "message": format!("No product with id '{}'.", args.product_id) }),
        };
        Ok(ToolOutput::new(result))
    }
}

// --- Project recommendations ---

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    BathroomRenovation,
    KitchenRemodel,
    DeckBuilding,
    Painting,
    FlooringInstallation,
    PlumbingRepair,
    ElectricalWork,
    Landscaping,
    GarageOrganization,
    FenceBuilding,
}

impl ProjectType {
    fn categories(self) -> &'static [&'static str] {
        match self {
            Self::BathroomRenovation => &["kitchen_bath", "plumbing", "hand_tools"],
            Self::KitchenRemodel => &["kitchen_bath", "lighting", "power_tools"],
            Self::DeckBuilding | Self::FenceBuilding => &["power_tools", "building_materials", "safety"],
            Self::Painting => &["paint", "hand_tools", "safety"],
            Self::FlooringInstallation => &["flooring", "power_tools", "safety"],
            Self::PlumbingRepair => &["plumbing", "hand_tools"],
            Self::ElectricalWork => &["electrical", "lighting", "safety"],
            Self::Landscaping => &["outdoor_garden", "hand_tools"],
            Self::GarageOrganization => &["storage", "lighting"],
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Budget,
    MidRange,
    Premium,
}

impl Budget {
    fn max_price(self) -> Option<f64> {
        match self {
            Self::Budget => Some(50.0),
            Self::MidRange => Some(150.0),
            Self::Premium => None,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProjectArgs {
    /// Type of home improvement project.
    pub project_type: ProjectType,
    /// Budget range for the project.
    #[serde(default)]
    pub budget: Option<Budget>,
}

pub struct GetProjectRecommendations(pub Arc<CatalogStore>);

#[async_trait]
impl Tool for GetProjectRecommendations {
    type Args = ProjectArgs;

    fn name(&self) -> &'static str {
        "get_project_recommendations"
    }

    fn description(&self) -> &'static str {
        "Get recommended products for a specific DIY project type."
    }

    async fn run(&self, _ctx: &ToolContext, args: ProjectArgs) -> Result<ToolOutput, ToolError> {
        let max_price = args.budget.and_then(Budget::max_price);
        let products = self.0.in_categories(args.project_type.categories(), max_price);
        let result = json!({ "products": products, "count": products.len() });
        Ok(ToolOutput::new(result.clone()).with_side_effect(SideChannelEvent::from_tool(
            SideChannelKind::Products,
            self.name(),
            result,
        )))
    }
}

// --- Cart ---
// The cart itself lives in the caller's UI; these tools only resolve products
// and tell the UI what to do.

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddToCartArgs {
    /// The name or description of the product to add (e.g. 'DeWalt drill').
    pub product_name: String,
    /// Number of items to add (default 1).
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

pub struct AddToCart(pub Arc<CatalogStore>);

#[async_trait]
impl Tool for AddToCart {
    type Args = AddToCartArgs;

    fn name(&self) -> &'static str {
        "add_to_cart"
    }

    fn description(&self) -> &'static str {
        "Add a product to the customer's shopping cart by searching for it by name."
    }

    async fn run(&self, _ctx: &ToolContext, args: AddToCartArgs) -> Result<ToolOutput, ToolError> {
        if args.quantity == 0 {
            return Err(ToolError::invalid_arguments("quantity must be at least 1"));
        }
        let query = SearchProductsArgs {
            query: args.product_name.clone(),
            limit: Some(1),
            ..Default::default()
        };
        let Some(product) = self.0.search(&query).into_iter().next() else {
            return Ok(ToolOutput::new(json!({
                "success": false,
                "error": format!("Could not find product matching: {}", args.product_name),
            })));
        };

        let result = json!({
            "success": true,
            "action": "add_to_cart",
            "message": format!("Added {} x {} to your cart.", args.quantity, product.name),
            "product": product,
            "quantity": args.quantity,
        });
        Ok(cart_output(self.name(), result))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EmptyArgs {}

pub struct ViewCart;

#[async_trait]
impl Tool for ViewCart {
    type Args = EmptyArgs;

    fn name(&self) -> &'static str {
        "view_cart"
    }

    fn description(&self) -> &'static str {
        "Show the customer their current shopping cart contents."
    }

    async fn run(&self, _ctx: &ToolContext, _args: EmptyArgs) -> Result<ToolOutput, ToolError> {
        Ok(cart_output(
            self.name(),
            json!({ "success": true, "action": "view_cart", "message": "Opening your shopping cart..." }),
        ))
    }
}

pub struct RemoveFromCart;

#[async_trait]
impl Tool for RemoveFromCart {
    type Args = ProductIdArgs;

    fn name(&self) -> &'static str {
        "remove_from_cart"
    }

    fn description(&self) -> &'static str {
        "Remove a product from the customer's shopping cart."
    }

    async fn run(&self, _ctx: &ToolContext, args: ProductIdArgs) -> Result<ToolOutput, ToolError> {
        Ok(cart_output(
            self.name(),
            json!({
                "success": true,
                "action": "remove_from_cart",
                "product_id": args.product_id,
                "message": "Removed item from your cart.",
            }),
        ))
    }
}

pub struct ClearCart;

#[async_trait]
impl Tool for ClearCart {
    type Args = EmptyArgs;

    fn name(&self) -> &'static str {
        "clear_cart"
    }

    fn description(&self) -> &'static str {
        "Clear all items from the customer's shopping cart."
    }

    async fn run(&self, _ctx: &ToolContext, _args: EmptyArgs) -> Result<ToolOutput, ToolError> {
        Ok(cart_output(
            self.name(),
            json!({ "success": true, "action": "clear_cart", "message": "Your cart has been cleared." }),
        ))
    }
}

fn cart_output(tool: &str, result: serde_json::Value) -> ToolOutput {
    ToolOutput::new(result.clone()).with_side_effect(SideChannelEvent::from_tool(
        SideChannelKind::CartAction,
        tool,
        result,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_channel::NullNotifier;
    use crate::tools::{ToolContext, ToolRegistry};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        ToolContext::new(
            Uuid::new_v4(),
            "call",
            CancellationToken::new(),
            Arc::new(NullNotifier),
        )
    }

    fn store() -> Arc<CatalogStore> {
        Arc::new(CatalogStore::demo())
    }

    #[tokio::test]
    async fn test_search_returns_products_and_recommendations() {
        let tool = SearchProducts(store());
        let args = SearchProductsArgs {
            query: "drill".to_string(),
            ..Default::default()
        };
        let output = tool.run(&ctx(), args).await.unwrap();

        let products = output.result["products"].as_array().unwrap();
        assert!(!products.is_empty());
        assert!(products[0]["name"].as_str().unwrap().contains("Drill"));

        let kinds: Vec<_> = output.side_effects.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![SideChannelKind::Products, SideChannelKind::Recommendation]);
        let recommended = output.side_effects[1].payload["products"].as_array().unwrap();
        assert!(recommended.len() <= MAX_RECOMMENDATIONS);
        assert!(
            recommended
                .iter()
                .all(|r| products.iter().all(|p| p["id"] != r["id"]))
        );
    }

    #[tokio::test]
    async fn test_search_respects_price_filters() {
        let args = SearchProductsArgs {
            query: "drill".to_string(),
            max_price: Some(150.0),
            ..Default::default()
        };
        let hits = store().search(&args);
        assert!(hits.iter().all(|p| p.price <= 150.0));
        assert!(hits.iter().all(|p| p.id != "p-101"));
    }

    #[tokio::test]
    async fn test_search_rejects_empty_query() {
        let tool = SearchProducts(store());
        let err = tool
            .run(&ctx(), SearchProductsArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_flooring_has_no_cross_sell() {
        let store = store();
        let flooring = store.get("p-800").unwrap().clone();
        assert!(store.related(&flooring.category, &[flooring.clone()]).is_empty());
    }

    #[tokio::test]
    async fn test_product_details_not_found_is_not_an_error() {
        let tool = GetProductDetails(store());
        let output = tool
            .run(&ctx(), ProductIdArgs { product_id: "nope".to_string() })
            .await
            .unwrap();
        assert_eq!(output.result["found"], false);
    }

    #[tokio::test]
    async fn test_add_to_cart_emits_cart_action() {
        let tool = AddToCart(store());
        let args = AddToCartArgs {
            product_name: "claw hammer".to_string(),
            quantity: 2,
        };
        let output = tool.run(&ctx(), args).await.unwrap();
        assert_eq!(output.result["success"], true);
        assert_eq!(output.result["product"]["id"], "p-201");
        assert_eq!(output.side_effects.len(), 1);
        assert_eq!(output.side_effects[0].kind, SideChannelKind::CartAction);
        assert_eq!(output.side_effects[0].tool.as_deref(), Some("add_to_cart"));
    }

    #[tokio::test]
    async fn test_project_recommendations_budget() {
        let tool = GetProjectRecommendations(store());
        let args = ProjectArgs {
            project_type: ProjectType::Painting,
            budget: Some(Budget::Budget),
        };
        let output = tool.run(&ctx(), args).await.unwrap();
        let products = output.result["products"].as_array().unwrap();
        assert!(!products.is_empty());
        assert!(products.iter().all(|p| p["price"].as_f64().unwrap() <= 50.0));
    }

    #[test]
    fn test_register_catalog_tools() {
        let registry = register_catalog_tools(ToolRegistry::builder(), store())
            .build()
            .unwrap();
        assert_eq!(registry.len(), 7);
        assert!(registry.contains("search_products"));
        assert!(registry.contains("clear_cart"));

        let project = registry
            .specs()
            .iter()
            .find(|s| s.name == "get_project_recommendations")
            .unwrap();
        assert_eq!(project.parameters["required"][0], "project_type");
    }
}
