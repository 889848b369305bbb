//! Property-based tests for join code uniqueness.
//!
//! Rooms are created against a code generator with a deliberately tiny code
//! space so collisions are frequent; every live room must still hold a
//! distinct code.

use std::sync::Arc;

use middleman_relay::directory::{BackendAddress, ServiceDirectory};
use middleman_relay::registry::{RegistryConfig, RoomRegistry, generate_join_code};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn generated_codes_have_requested_shape(len in 1usize..16) {
        let code = generate_join_code(len);
        prop_assert_eq!(code.len(), len);
        prop_assert!(code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
    }

    #[test]
    fn live_codes_are_pairwise_distinct(rooms in 1usize..30) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let codes = runtime.block_on(async move {
            let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let services = Arc::new(ServiceDirectory::new());
            services.register("trivia", BackendAddress::from(backend.local_addr().unwrap()));

            // One-character codes: 36 possibilities, so collisions are common.
            let registry = Arc::new(
                RoomRegistry::new(services, RegistryConfig::default())
                    .with_code_generator(Box::new(|| generate_join_code(1))),
            );

            let mut handles = Vec::new();
            for _ in 0..rooms {
                handles.push(registry.create_room("trivia").await.unwrap());
            }
            let codes = registry.join_codes();
            registry.shutdown().await;
            drop(handles);
            codes
        });

        prop_assert_eq!(codes.len(), rooms);
        let mut unique = codes.clone();
        unique.dedup();
        prop_assert_eq!(unique.len(), codes.len());
    }
}
