//! Raw register access against a resolved identity
//!
//! Words are returned exactly as the transport reports them. Decoding is
//! left to the caller, with [`LinkInfo`] and [`PortStatus`] available for
//! the two standard layouts.

use cambus_core::register::PHY_VALUE_MASK;
use cambus_core::{
    BusError, DeviceIdentity, HardwareId, LinkInfo, PhyAddress, PortRegister, PortStatus,
    RegisterAddress, Result,
};
use tracing::trace;

use crate::manager::BusManager;

impl BusManager {
    /// Hardware behind `identity`, if its interface has registers of this kind
    fn register_target(
        &self,
        identity: DeviceIdentity,
        address: RegisterAddress,
    ) -> Result<HardwareId> {
        let snapshot = self.snapshot();
        let device = snapshot.descriptor(identity)?;
        let caps = device.interface.capabilities();
        let supported = match address {
            RegisterAddress::Phy(_) => caps.phy_registers,
            RegisterAddress::Port(_) => caps.port_registers,
        };
        if !supported {
            let operation = match address {
                RegisterAddress::Phy(_) => "phy register access",
                RegisterAddress::Port(_) => "port register access",
            };
            return Err(BusError::not_supported(device.interface, operation));
        }
        Ok(device.hardware_id)
    }

    /// Read one register. A transport that stays silent past the register
    /// timeout yields `Timeout`; the read is not retried.
    pub async fn read_register(
        &self,
        identity: DeviceIdentity,
        address: RegisterAddress,
    ) -> Result<u32> {
        let hardware_id = self.register_target(identity, address)?;
        let value = self
            .shared
            .call_driver(self.shared.config.register_timeout(), move |driver| {
                driver.read_register(hardware_id, address)
            })
            .await?;
        trace!(device = %hardware_id, register = %address, value = value, "Read register");
        Ok(value)
    }

    pub async fn write_register(
        &self,
        identity: DeviceIdentity,
        address: RegisterAddress,
        value: u32,
    ) -> Result<()> {
        let hardware_id = self.register_target(identity, address)?;
        if !address.is_writable() {
            let interface = self.snapshot().interface_type(identity)?;
            return Err(BusError::not_supported(interface, "link info write"));
        }
        if matches!(address, RegisterAddress::Phy(_)) && value > PHY_VALUE_MASK {
            return Err(BusError::InvalidParameter(format!(
                "phy register value 0x{:x} wider than 8 bits",
                value
            )));
        }

        self.shared
            .call_driver(self.shared.config.register_timeout(), move |driver| {
                driver.write_register(hardware_id, address, value)
            })
            .await?;
        trace!(device = %hardware_id, register = %address, value = value, "Wrote register");
        Ok(())
    }

    pub async fn read_phy_register(
        &self,
        identity: DeviceIdentity,
        page: u32,
        port: u32,
        address: u32,
    ) -> Result<u32> {
        let address = RegisterAddress::Phy(PhyAddress::new(page, port, address)?);
        self.read_register(identity, address).await
    }

    pub async fn write_phy_register(
        &self,
        identity: DeviceIdentity,
        page: u32,
        port: u32,
        address: u32,
        value: u32,
    ) -> Result<()> {
        let address = RegisterAddress::Phy(PhyAddress::new(page, port, address)?);
        self.write_register(identity, address, value).await
    }

    pub async fn usb_link_info(&self, identity: DeviceIdentity) -> Result<LinkInfo> {
        self.read_register(identity, RegisterAddress::Port(PortRegister::LinkInfo))
            .await
            .map(LinkInfo)
    }

    pub async fn usb_port_status(&self, identity: DeviceIdentity) -> Result<PortStatus> {
        self.read_register(identity, RegisterAddress::Port(PortRegister::PortStatus))
            .await
            .map(PortStatus)
    }
}
