//! Local offer/subscribe/notify flow through the application runtime.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::wait_for;
use routeip::{Application, Config, Error, ServiceConfig};

const SERVICE: u16 = 0x1234;
const INSTANCE: u16 = 0x0001;
const EVENTGROUP: u16 = 0x0010;
const FIELD: u16 = 0x8001;

fn app_config() -> Config {
    Config::builder()
        .application_name("local-pubsub-test")
        .service(ServiceConfig::new(SERVICE, INSTANCE))
        .build()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn field_replay_delivers_cached_value_once_with_initial_flag() {
    let app = Application::new(app_config());
    app.init().await.unwrap();
    app.start();

    app.offer_service(SERVICE, INSTANCE, 1, 0).await.unwrap();
    let eventgroups: HashSet<u16> = [EVENTGROUP].into_iter().collect();
    app.offer_event(SERVICE, INSTANCE, FIELD, &eventgroups, true);

    // Set the field before anyone subscribes.
    app.notify(SERVICE, INSTANCE, FIELD, Bytes::from_static(&[0xAA]));

    let deliveries = Arc::new(Mutex::new(Vec::<(Vec<u8>, bool)>::new()));
    {
        let deliveries = Arc::clone(&deliveries);
        app.register_message_handler(SERVICE, INSTANCE, FIELD, move |message| {
            deliveries
                .lock()
                .unwrap()
                .push((message.payload.to_vec(), message.initial));
        });
    }

    app.subscribe(SERVICE, INSTANCE, EVENTGROUP, 1, FIELD)
        .await
        .unwrap();

    // Exactly one replayed notification, payload 0xAA, marked initial.
    assert!(
        wait_for(Duration::from_secs(2), || !deliveries.lock().unwrap().is_empty()).await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let seen = deliveries.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (vec![0xAA], true));
    }

    // A later update arrives without the initial flag.
    app.notify(SERVICE, INSTANCE, FIELD, Bytes::from_static(&[0xBB]));
    assert!(wait_for(Duration::from_secs(2), || deliveries.lock().unwrap().len() == 2).await);
    assert_eq!(deliveries.lock().unwrap()[1], (vec![0xBB], false));

    app.stop();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn offer_is_idempotent_for_identical_version_only() {
    let app = Application::new(app_config());
    app.init().await.unwrap();
    app.start();

    app.offer_service(SERVICE, INSTANCE, 1, 3).await.unwrap();
    // Same version again: fine.
    app.offer_service(SERVICE, INSTANCE, 1, 3).await.unwrap();
    // Different version: rejected, the first provider stays.
    assert!(matches!(
        app.offer_service(SERVICE, INSTANCE, 2, 0).await,
        Err(Error::AlreadyOffered { .. })
    ));

    assert!(app.is_available(SERVICE, INSTANCE, 1, 3));
    app.stop();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn availability_handler_fires_on_offer_and_stop_offer() {
    let app = Application::new(app_config());
    app.init().await.unwrap();
    app.start();

    let transitions = Arc::new(Mutex::new(Vec::<bool>::new()));
    {
        let transitions = Arc::clone(&transitions);
        app.register_availability_handler(
            SERVICE,
            INSTANCE,
            move |_, _, available| {
                transitions.lock().unwrap().push(available);
            },
            1,
            0,
        );
    }

    app.offer_service(SERVICE, INSTANCE, 1, 0).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        transitions.lock().unwrap().contains(&true)
    })
    .await);

    app.stop_offer_service(SERVICE, INSTANCE, 1, 0);
    assert!(wait_for(Duration::from_secs(2), || {
        transitions.lock().unwrap().contains(&false)
    })
    .await);
    assert!(!app.is_available(SERVICE, INSTANCE, 1, 0));

    app.stop();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn subscription_handler_can_reject_subscribers() {
    let app = Application::new(app_config());
    app.init().await.unwrap();
    app.start();

    app.offer_service(SERVICE, INSTANCE, 1, 0).await.unwrap();
    let eventgroups: HashSet<u16> = [EVENTGROUP].into_iter().collect();
    app.offer_event(SERVICE, INSTANCE, FIELD, &eventgroups, true);

    app.register_subscription_handler(SERVICE, INSTANCE, EVENTGROUP, |_, subscribed| {
        // Reject every incoming subscription.
        !subscribed
    });

    let errors = Arc::new(Mutex::new(Vec::<u16>::new()));
    {
        let errors = Arc::clone(&errors);
        app.register_subscription_error_handler(SERVICE, INSTANCE, EVENTGROUP, move |code| {
            errors.lock().unwrap().push(code);
        });
    }

    assert!(app
        .subscribe(SERVICE, INSTANCE, EVENTGROUP, 1, FIELD)
        .await
        .is_err());
    assert!(wait_for(Duration::from_secs(2), || !errors.lock().unwrap().is_empty()).await);

    app.stop();
}
