//! End-to-end tenant lifecycle: discovery, composition, descriptor updates,
//! and rebuilds, wired the way a host process wires the kernel.

use std::sync::Arc;

use warren_extension_sdk::{CapabilityRegistry, ServiceKey, service};
use warren_kernel::caching::{CacheHolder, NullSink};
use warren_kernel::extensions::{BuiltinModules, ExtensionLoader, ReferencedExtensionLoader};
use warren_kernel::shell::{
    KERNEL_FEATURE, KernelServices, SETTINGS_FEATURE, SHELL_DESCRIPTOR_MANAGER_KEY, ShellFeature,
};
use warren_kernel::{
    CompositionStrategy, ExtensionManager, ShellContainerFactory, ShellContextFactory,
    ShellDescriptorManager, ShellSettings, SiteFolder,
};

struct Site {
    _dir: tempfile::TempDir,
    folder: Arc<SiteFolder>,
    services: Arc<KernelServices>,
    factory: ShellContextFactory,
}

/// Wire the kernel over a site containing one builtin blog module.
fn site_with_blog() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let folder = SiteFolder::new(dir.path()).unwrap();
    folder
        .write(
            "modules/blog/module.toml",
            "id = \"blog\"\nname = \"Blog\"\nversion = \"1.0.0\"",
        )
        .unwrap();

    let builtins = Arc::new(BuiltinModules::new());
    builtins.register(
        "blog",
        Arc::new(|registry: &mut CapabilityRegistry| {
            registry
                .feature("blog")
                .component("blog.PostService")
                .expose("blog.posts")
                .with_factory(|_| Ok(service("posts".to_string())))
        }),
    );

    let loaders: Vec<Arc<dyn ExtensionLoader>> =
        vec![Arc::new(ReferencedExtensionLoader::new(builtins))];
    let services = KernelServices::open(folder.clone()).unwrap();
    let holder = Arc::new(CacheHolder::new());
    let manager = Arc::new(ExtensionManager::new(folder.clone(), loaders, holder));
    let composition = Arc::new(CompositionStrategy::new(manager));
    let container = Arc::new(ShellContainerFactory::new(services.clone()));
    let factory = ShellContextFactory::new(composition, container, services.clone());

    Site {
        _dir: dir,
        folder,
        services,
        factory,
    }
}

#[test]
fn test_fresh_tenant_runs_on_minimum_descriptor() {
    let site = site_with_blog();
    let settings = ShellSettings::new("Default");

    let context = site
        .factory
        .create_shell_context(&mut NullSink, &settings)
        .unwrap();

    assert_eq!(context.descriptor().serial_number, 1);
    assert_eq!(
        context.descriptor().feature_names(),
        vec![KERNEL_FEATURE, SETTINGS_FEATURE]
    );
    // Disabled feature: the blog component is not in the container.
    assert!(
        context
            .scope
            .try_resolve::<String>(&ServiceKey::new("blog.posts"))
            .is_none()
    );
}

#[test]
fn test_enable_feature_then_rebuild_serves_it() {
    let site = site_with_blog();
    let settings = ShellSettings::new("Default");

    let context = site
        .factory
        .create_shell_context(&mut NullSink, &settings)
        .unwrap();
    let manager: Arc<dyn ShellDescriptorManager> = context
        .scope
        .resolve(&ServiceKey::new(SHELL_DESCRIPTOR_MANAGER_KEY))
        .unwrap();

    let updated = manager
        .update_shell_descriptor(
            1,
            vec![
                ShellFeature::new(KERNEL_FEATURE),
                ShellFeature::new(SETTINGS_FEATURE),
                ShellFeature::new("blog"),
            ],
        )
        .unwrap();
    assert_eq!(updated.serial_number, 2);
    context.dispose();

    // The snapshot still says serial 1; construction detects the drift and
    // settles on the updated descriptor.
    let rebuilt = site
        .factory
        .create_shell_context(&mut NullSink, &settings)
        .unwrap();
    assert_eq!(rebuilt.descriptor().serial_number, 2);
    assert!(rebuilt.descriptor().has_feature("blog"));

    let posts: String = rebuilt
        .scope
        .resolve(&ServiceKey::new("blog.posts"))
        .unwrap();
    assert_eq!(posts, "posts");

    // Superseded serials stay in the log.
    let history = site.services.descriptor_log.history("Default");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].serial_number, 1);
}

#[test]
fn test_serials_survive_restart() {
    let site = site_with_blog();
    let settings = ShellSettings::new("Default");
    site.factory
        .create_shell_context(&mut NullSink, &settings)
        .unwrap();

    // Restart simulation: reopen the stores over the same site folder.
    let services = KernelServices::open(site.folder.clone()).unwrap();
    let appended = services
        .descriptor_log
        .append("Default", vec![KERNEL_FEATURE.to_string()])
        .unwrap();
    assert_eq!(appended.serial_number, 2);
}

#[test]
fn test_tenants_are_isolated() {
    let site = site_with_blog();

    let first = site
        .factory
        .create_shell_context(&mut NullSink, &ShellSettings::new("Alpha"))
        .unwrap();
    let second = site
        .factory
        .create_shell_context(&mut NullSink, &ShellSettings::new("Beta"))
        .unwrap();

    // Serials are global, descriptors and containers per tenant.
    assert_ne!(
        first.descriptor().serial_number,
        second.descriptor().serial_number
    );
    first.dispose();
    assert!(first.scope.is_disposed());
    assert!(!second.scope.is_disposed());
    assert_eq!(second.tenant(), "Beta");
}
