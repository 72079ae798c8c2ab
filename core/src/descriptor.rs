//! Method and service descriptors.
//!
//! Descriptors identify a service method by fully-qualified name and
//! carry the input/output message type names the registries validate
//! against. The descriptor database itself is a collaborator — embedders
//! typically project it out of their schema tooling — but a small
//! in-memory pool is provided for tests and simple deployments.

/// Describes one RPC method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Fully qualified method name, e.g. `example.Frontend/GetFoo`.
    pub full_name: String,
    /// Fully qualified owning service name, e.g. `example.Frontend`.
    pub service: String,
    /// Bare method name, e.g. `GetFoo`.
    pub name: String,
    /// Fully qualified input message type name.
    pub input_type: String,
    /// Fully qualified output message type name.
    pub output_type: String,
    /// Whether the method streams from server to client.
    pub server_streaming: bool,
}

impl MethodDescriptor {
    pub fn new(
        service: impl Into<String>,
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
        server_streaming: bool,
    ) -> Self {
        let service = service.into();
        let name = name.into();
        MethodDescriptor {
            full_name: format!("{service}/{name}"),
            service,
            name,
            input_type: input_type.into(),
            output_type: output_type.into(),
            server_streaming,
        }
    }
}

/// Describes one service: its name and methods.
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptor {
    pub full_name: String,
    pub methods: Vec<MethodDescriptor>,
}

/// Lookup surface over registered descriptors.
pub trait DescriptorDatabase {
    fn find_service(&self, full_name: &str) -> Option<&ServiceDescriptor>;
    fn find_method(&self, full_name: &str) -> Option<&MethodDescriptor>;
    fn list_methods(&self, service_full_name: &str) -> Vec<&MethodDescriptor>;
}

/// In-memory descriptor database.
#[derive(Debug, Default)]
pub struct DescriptorPool {
    services: Vec<ServiceDescriptor>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, service: ServiceDescriptor) -> &mut Self {
        self.services.push(service);
        self
    }
}

impl DescriptorDatabase for DescriptorPool {
    fn find_service(&self, full_name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.full_name == full_name)
    }

    fn find_method(&self, full_name: &str) -> Option<&MethodDescriptor> {
        self.services.iter().flat_map(|s| s.methods.iter()).find(|m| m.full_name == full_name)
    }

    fn list_methods(&self, service_full_name: &str) -> Vec<&MethodDescriptor> {
        self.find_service(service_full_name)
            .map(|s| s.methods.iter().collect())
            .unwrap_or_default()
    }
}
