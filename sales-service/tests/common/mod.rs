//! Common test utilities for sales-service integration tests.
//!
//! Identity, catalog and logistics run as in-process tonic servers backed by
//! shared state that each test can seed.

use futures::Stream;
use sales_service::config::{AuthConfig, DatabaseConfig, SalesConfig, ServiceEndpoint};
use sales_service::grpc::proto::{
    customer_service_client::CustomerServiceClient, order_service_client::OrderServiceClient,
    return_service_client::ReturnServiceClient, salesman_service_client::SalesmanServiceClient,
    CreateCustomerRequest, CreateOrderRequest, CreateSalesmanRequest, Order, OrderLineInput,
};
use sales_service::startup::Application;
use service_core::config::Config as CommonConfig;
use service_core::grpc::proto::catalog::{
    product_service_server::{ProductService, ProductServiceServer},
    ListProductsRequest, ListProductsResponse, Product,
};
use service_core::grpc::proto::identity::{
    identity_service_server::{IdentityService, IdentityServiceServer},
    Branch, CheckCapabilityRequest, CheckCapabilityResponse, ListBranchesRequest,
    ListBranchesResponse, Region, User, ValidateTokenRequest, ValidateTokenResponse,
    ViewBranchRequest, ViewBranchResponse, ViewRegionRequest, ViewRegionResponse, ViewUserRequest,
    ViewUserResponse,
};
use service_core::grpc::proto::logistics::{
    delivery_service_server::{DeliveryService, DeliveryServiceServer},
    Fulfillment, ListFulfillmentByOrderRequest, ListFulfillmentByOrderResponse,
};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Once};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};
use tonic::{Request, Response, Status};
use uuid::Uuid;

static INIT: Once = Once::new();

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,sales_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ============================================================================
// Collaborator doubles
// ============================================================================

/// Identity double. Users without an entry in `scopes` are tenant-wide.
#[derive(Default)]
pub struct FakeIdentity {
    pub branches: Mutex<Vec<Branch>>,
    pub regions: Mutex<HashMap<String, Vec<String>>>,
    /// user id -> (branch id, region id)
    pub scopes: Mutex<HashMap<String, (String, String)>>,
}

impl FakeIdentity {
    pub fn add_branch(&self, name: &str) -> Uuid {
        let branch_id = Uuid::new_v4();
        self.branches.lock().unwrap().push(Branch {
            branch_id: branch_id.to_string(),
            name: name.to_string(),
            ..Default::default()
        });
        branch_id
    }

    pub fn assign_branch(&self, user_id: &str, branch_id: &Uuid) {
        self.scopes
            .lock()
            .unwrap()
            .insert(user_id.to_string(), (branch_id.to_string(), String::new()));
    }
}

#[derive(Clone)]
struct IdentityHandle(Arc<FakeIdentity>);

#[tonic::async_trait]
impl IdentityService for IdentityHandle {
    type ListBranchesStream = ResponseStream<ListBranchesResponse>;

    async fn view_user(&self, request: Request<ViewUserRequest>) -> Result<Response<ViewUserResponse>, Status> {
        let user_id = request.into_inner().user_id;
        let (branch_id, region_id) = self
            .0
            .scopes
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default();
        Ok(Response::new(ViewUserResponse {
            user: Some(User {
                user_id,
                branch_id,
                region_id,
                ..Default::default()
            }),
        }))
    }

    async fn view_region(
        &self,
        request: Request<ViewRegionRequest>,
    ) -> Result<Response<ViewRegionResponse>, Status> {
        let region_id = request.into_inner().region_id;
        let members = self.0.regions.lock().unwrap().get(&region_id).cloned();
        let members = members.ok_or_else(|| Status::not_found("Region not found"))?;
        Ok(Response::new(ViewRegionResponse {
            region: Some(Region {
                region_id,
                branches: members
                    .into_iter()
                    .map(|branch_id| Branch {
                        branch_id,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        }))
    }

    async fn view_branch(
        &self,
        request: Request<ViewBranchRequest>,
    ) -> Result<Response<ViewBranchResponse>, Status> {
        let branch_id = request.into_inner().branch_id;
        let branch = self
            .0
            .branches
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.branch_id == branch_id)
            .cloned()
            .ok_or_else(|| Status::not_found("Branch not found"))?;
        Ok(Response::new(ViewBranchResponse { branch: Some(branch) }))
    }

    async fn list_branches(
        &self,
        _request: Request<ListBranchesRequest>,
    ) -> Result<Response<Self::ListBranchesStream>, Status> {
        let items: Vec<_> = self
            .0
            .branches
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .map(|branch| Ok(ListBranchesResponse { branch: Some(branch) }))
            .collect();
        Ok(Response::new(Box::pin(tokio_stream::iter(items))))
    }

    async fn validate_token(
        &self,
        _request: Request<ValidateTokenRequest>,
    ) -> Result<Response<ValidateTokenResponse>, Status> {
        Err(Status::unimplemented("not used by sales-service"))
    }

    async fn check_capability(
        &self,
        _request: Request<CheckCapabilityRequest>,
    ) -> Result<Response<CheckCapabilityResponse>, Status> {
        Ok(Response::new(CheckCapabilityResponse { allowed: true }))
    }
}

/// Catalog double keyed by product id.
#[derive(Default)]
pub struct FakeCatalog {
    pub products: Mutex<HashMap<String, Product>>,
}

impl FakeCatalog {
    pub fn add_product(&self, code: &str, unit_price: &str) -> Uuid {
        let product_id = Uuid::new_v4();
        self.products.lock().unwrap().insert(
            product_id.to_string(),
            Product {
                product_id: product_id.to_string(),
                code: code.to_string(),
                name: format!("Product {}", code),
                unit_price: unit_price.to_string(),
                ..Default::default()
            },
        );
        product_id
    }
}

#[derive(Clone)]
struct CatalogHandle(Arc<FakeCatalog>);

#[tonic::async_trait]
impl ProductService for CatalogHandle {
    type ListProductsStream = ResponseStream<ListProductsResponse>;

    async fn list_products(
        &self,
        request: Request<ListProductsRequest>,
    ) -> Result<Response<Self::ListProductsStream>, Status> {
        let products = self.0.products.lock().unwrap();
        let items: Vec<_> = request
            .into_inner()
            .product_ids
            .iter()
            .filter_map(|id| products.get(id).cloned())
            .map(|product| Ok(ListProductsResponse { product: Some(product) }))
            .collect();
        Ok(Response::new(Box::pin(tokio_stream::iter(items))))
    }
}

/// Logistics double: orders in `fulfilled` have a delivery record.
#[derive(Default)]
pub struct FakeLogistics {
    pub fulfilled: Mutex<HashSet<String>>,
}

impl FakeLogistics {
    pub fn fulfil(&self, order_id: &str) {
        self.fulfilled.lock().unwrap().insert(order_id.to_string());
    }
}

#[derive(Clone)]
struct LogisticsHandle(Arc<FakeLogistics>);

#[tonic::async_trait]
impl DeliveryService for LogisticsHandle {
    type ListFulfillmentByOrderStream = ResponseStream<ListFulfillmentByOrderResponse>;

    async fn list_fulfillment_by_order(
        &self,
        request: Request<ListFulfillmentByOrderRequest>,
    ) -> Result<Response<Self::ListFulfillmentByOrderStream>, Status> {
        let order_id = request.into_inner().order_id;
        let items = if self.0.fulfilled.lock().unwrap().contains(&order_id) {
            vec![Ok(ListFulfillmentByOrderResponse {
                fulfillment: Some(Fulfillment {
                    fulfillment_id: Uuid::new_v4().to_string(),
                    order_id,
                    status: "shipped".to_string(),
                    ..Default::default()
                }),
            })]
        } else {
            Vec::new()
        };
        Ok(Response::new(Box::pin(tokio_stream::iter(items))))
    }
}

async fn serve_doubles(
    identity: Arc<FakeIdentity>,
    catalog: Arc<FakeCatalog>,
    logistics: Arc<FakeLogistics>,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind collaborator listener");
    let addr = listener.local_addr().expect("Failed to read collaborator address");

    tokio::spawn(async move {
        Server::builder()
            .add_service(IdentityServiceServer::new(IdentityHandle(identity)))
            .add_service(ProductServiceServer::new(CatalogHandle(catalog)))
            .add_service(DeliveryServiceServer::new(LogisticsHandle(logistics)))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .ok();
    });

    format!("http://{}", addr)
}

// ============================================================================
// Application
// ============================================================================

/// Test configuration with empty auth endpoint (disables capability checking).
fn test_config(collaborators: &str) -> SalesConfig {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set - use scripts/integ-tests.sh to run tests");
    let endpoint = || ServiceEndpoint {
        url: collaborators.to_string(),
    };

    SalesConfig {
        common: CommonConfig { port: 0 },
        service_name: "sales-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: database_url,
            max_connections: 4,
            min_connections: 1,
        },
        identity_service: endpoint(),
        catalog_service: endpoint(),
        logistics_service: endpoint(),
        auth: AuthConfig {
            auth_service_endpoint: String::new(),
        },
    }
}

/// Test application wrapper.
#[allow(dead_code)]
pub struct TestApp {
    pub orders: OrderServiceClient<Channel>,
    pub returns: ReturnServiceClient<Channel>,
    pub customers: CustomerServiceClient<Channel>,
    pub salesmen: SalesmanServiceClient<Channel>,
    pub identity: Arc<FakeIdentity>,
    pub catalog: Arc<FakeCatalog>,
    pub logistics: Arc<FakeLogistics>,
    pub tenant_id: Uuid,
    pub branch_id: Uuid,
    pub http_port: u16,
    pub grpc_port: u16,
}

/// Spawn a test application with one branch and a unique tenant ID.
pub async fn spawn_app() -> TestApp {
    init_tracing();

    let identity = Arc::new(FakeIdentity::default());
    let catalog = Arc::new(FakeCatalog::default());
    let logistics = Arc::new(FakeLogistics::default());
    let branch_id = identity.add_branch("Jakarta Pusat");
    let collaborators = serve_doubles(identity.clone(), catalog.clone(), logistics.clone()).await;

    // Collaborator channels connect eagerly; give the doubles a moment.
    let app = {
        let mut attempts = 0;
        loop {
            match Application::build_without_migrations(test_config(&collaborators)).await {
                Ok(app) => break app,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
                }
                Err(e) => panic!("Failed to build application: {}", e),
            }
        }
    };

    let http_port = app.http_port();
    let grpc_port = app.grpc_port();
    let grpc_addr = format!("http://127.0.0.1:{}", grpc_port);

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let channel = {
        let mut attempts = 0;
        loop {
            match Channel::from_shared(grpc_addr.clone())
                .expect("Invalid gRPC address")
                .connect()
                .await
            {
                Ok(channel) => break channel,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
                }
                Err(e) => panic!("Failed to connect gRPC client after 20 attempts: {}", e),
            }
        }
    };

    TestApp {
        orders: OrderServiceClient::new(channel.clone()),
        returns: ReturnServiceClient::new(channel.clone()),
        customers: CustomerServiceClient::new(channel.clone()),
        salesmen: SalesmanServiceClient::new(channel),
        identity,
        catalog,
        logistics,
        tenant_id: Uuid::new_v4(),
        branch_id,
        http_port,
        grpc_port,
    }
}

/// Helper to inject tenant ID and user ID into request metadata.
pub fn with_tenant<T>(request: T, tenant_id: &Uuid) -> tonic::Request<T> {
    as_user(request, tenant_id, "test-user")
}

pub fn as_user<T>(request: T, tenant_id: &Uuid, user_id: &str) -> tonic::Request<T> {
    let mut req = tonic::Request::new(request);
    req.metadata_mut()
        .insert("x-tenant-id", tenant_id.to_string().parse().unwrap());
    req.metadata_mut()
        .insert("x-user-id", user_id.parse().unwrap());
    req
}

#[allow(dead_code)]
impl TestApp {
    pub async fn create_customer(&self) -> String {
        let code = format!("C-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.customers
            .clone()
            .create_customer(with_tenant(
                CreateCustomerRequest {
                    code,
                    name: "Toko Maju".to_string(),
                    address: "Jl. Merdeka 1".to_string(),
                    phone: "021-555".to_string(),
                },
                &self.tenant_id,
            ))
            .await
            .expect("Failed to create customer")
            .into_inner()
            .customer
            .unwrap()
            .customer_id
    }

    pub async fn create_salesman(&self) -> String {
        let code = format!("S-{}", &Uuid::new_v4().simple().to_string()[..8]);
        self.salesmen
            .clone()
            .create_salesman(with_tenant(
                CreateSalesmanRequest {
                    code,
                    name: "Budi".to_string(),
                    email: "budi@example.com".to_string(),
                    address: String::new(),
                    phone: String::new(),
                },
                &self.tenant_id,
            ))
            .await
            .expect("Failed to create salesman")
            .into_inner()
            .salesman
            .unwrap()
            .salesman_id
    }

    /// Order request on the app's branch with a fresh customer and salesman.
    pub async fn order_request(&self, lines: &[(Uuid, i32)]) -> CreateOrderRequest {
        CreateOrderRequest {
            branch_id: self.branch_id.to_string(),
            customer_id: self.create_customer().await,
            salesman_id: self.create_salesman().await,
            order_date: "2024-05-31".to_string(),
            remark: "counter sale".to_string(),
            discount_amount: None,
            discount_percentage: None,
            lines: lines
                .iter()
                .map(|(product_id, quantity)| OrderLineInput {
                    line_id: None,
                    product_id: product_id.to_string(),
                    unit_price: None,
                    discount_amount: None,
                    discount_percentage: None,
                    quantity: Some(*quantity),
                })
                .collect(),
        }
    }

    pub async fn create_order(&self, lines: &[(Uuid, i32)]) -> Order {
        let request = self.order_request(lines).await;
        self.orders
            .clone()
            .create_order(with_tenant(request, &self.tenant_id))
            .await
            .expect("Failed to create order")
            .into_inner()
            .order
            .unwrap()
    }
}
