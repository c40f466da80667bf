//! Built-in driver factories, one cargo feature per vendor crate.

use lab_core::DriverFactory;

/// Every factory compiled into this build.
pub fn default_factories() -> Vec<Box<dyn DriverFactory>> {
    #[allow(unused_mut)]
    let mut factories: Vec<Box<dyn DriverFactory>> = Vec::new();

    #[cfg(feature = "newport")]
    {
        factories.push(Box::new(lab_driver_newport::Esp300Factory));
        factories.push(Box::new(lab_driver_newport::Newport1830CFactory));
    }

    #[cfg(feature = "thorlabs")]
    {
        factories.push(Box::new(lab_driver_thorlabs::Pm100dFactory));
        factories.push(Box::new(lab_driver_thorlabs::Fw102cFactory));
        factories.push(Box::new(lab_driver_thorlabs::Ell14Factory));
        factories.push(Box::new(lab_driver_thorlabs::Ell14AttenuatorFactory));
    }

    #[cfg(feature = "stanford")]
    {
        factories.push(Box::new(lab_driver_stanford::Sr830Factory));
        factories.push(Box::new(lab_driver_stanford::Dg645Factory));
    }

    #[cfg(feature = "tektronix")]
    factories.push(Box::new(lab_driver_tektronix::Tds2000Factory));

    #[cfg(feature = "keysight")]
    factories.push(Box::new(lab_driver_keysight::Ks33220aFactory));

    #[cfg(feature = "cobolt")]
    factories.push(Box::new(lab_driver_cobolt::Cobolt0601Factory));

    #[cfg(feature = "coherent")]
    factories.push(Box::new(lab_driver_coherent::Innova300cFactory));

    #[cfg(feature = "lakeshore")]
    factories.push(Box::new(lab_driver_lakeshore::Ls332Factory));

    #[cfg(feature = "sutter")]
    factories.push(Box::new(lab_driver_sutter::Lambda103Factory));

    #[cfg(feature = "aviosys")]
    factories.push(Box::new(lab_driver_aviosys::IpPower9258Factory));

    factories
}
