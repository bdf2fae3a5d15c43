//! Export macro for dynamically loaded (cdylib) modules.

/// Export a module's capability registration function across the cdylib
/// boundary.
///
/// The argument is a `fn(&mut CapabilityRegistry) -> RegistryResult<()>`
/// path. The macro emits the two unmangled symbols the host's precompiled
/// loader looks up: `warren_module_abi_version` and
/// `warren_module_capabilities`. The capability symbol returns a boxed
/// [`crate::CapabilitySet`] the host takes ownership of, or null when
/// registration fails.
///
/// # Example
///
/// ```rust
/// use warren_extension_sdk::prelude::*;
///
/// fn configure(registry: &mut CapabilityRegistry) -> RegistryResult<()> {
///     registry
///         .feature("blog")
///         .component("blog.PostService")
///         .expose("blog.posts")
///         .with_factory(|_| Ok(service(String::from("posts"))))
/// }
///
/// export_module!(configure);
/// ```
#[macro_export]
macro_rules! export_module {
    ($configure:path) => {
        #[no_mangle]
        pub extern "C" fn warren_module_abi_version() -> u32 {
            $crate::ABI_VERSION
        }

        #[no_mangle]
        pub extern "C" fn warren_module_capabilities() -> *mut $crate::CapabilitySet {
            let mut registry = $crate::CapabilityRegistry::new();
            match $configure(&mut registry) {
                Ok(()) => Box::into_raw(Box::new(registry.into_set())),
                Err(_) => std::ptr::null_mut(),
            }
        }
    };
}
