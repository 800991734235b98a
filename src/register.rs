//! This module is used to define the registers, codes and models of the calibrated meters.

use strum_macros::{Display, EnumIter, EnumString};

/// Holding registers of the meter, as addressed in Modbus PDUs.
///
/// Every value is an IEEE-754 float spread over two consecutive registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter)]
#[repr(u16)]
pub enum MeterRegister {
    /// __R__ - Start of the live measurement block.
    ///
    /// Nine floats: voltage L1-L3, current L1-L3, active power L1-L3.
    Measurements = 0x0000,
    /// __W__ - Serial number, written as a float. Needs [`PROGRAMMING_UNLOCK`] first.
    SerialNumber = 0x17A6,
    /// __W__ - Manufacturing date as `YYMM`, written as a float.
    ManufactureDate = 0x17A8,
    /// __W__ - Model code, see [`MeterModel::code`].
    ModelCode = 0x17AE,
    /// __R/W__ - Calibration done / calibration status.
    ///
    /// Reads back `2.0` once a busy calibration step has finished, and `10.0`
    /// after the cal-done flag has been committed.
    CalDone = 0x17B8,
    /// __W__ - Calibration command register. Step codes such as `904` are written here.
    Command = 0x2580,
}

impl From<MeterRegister> for u16 {
    fn from(value: MeterRegister) -> Self {
        value as u16
    }
}

/// Function codes used on the MCW tunnel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Read-style responses carry a byte count after the function code.
    pub const fn has_byte_count(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(other),
        }
    }
}

/// Written to [`MeterRegister::Command`] to open a calibration session.
pub const CALIBRATION_UNLOCK: u32 = 2023;

/// Written to a programming register before its value may be changed.
pub const PROGRAMMING_UNLOCK: u32 = 2121;

/// Value written to [`MeterRegister::CalDone`] to commit the calibration.
pub const CAL_DONE_VALUE: f32 = 1.0;

/// Value [`MeterRegister::CalDone`] reads back once the commit was accepted.
pub const CAL_DONE_CONFIRMED: f32 = 10.0;

/// Value [`MeterRegister::CalDone`] reads back once a busy step has finished.
pub const STEP_READY: f32 = 2.0;

/// Current rating of a meter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter, EnumString, Display)]
pub enum MeterRating {
    #[strum(serialize = "100A")]
    A100,
    #[strum(serialize = "80A")]
    A80,
}

/// Communication variant of a meter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, EnumIter, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum MeterVariant {
    #[strum(serialize = "2TS")]
    TwoTs,
    #[strum(serialize = "MODBUS")]
    Modbus,
    #[strum(serialize = "MBUS")]
    MBus,
}

/// Rating and variant together select the model code programmed after calibration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MeterModel {
    pub rating: MeterRating,
    pub variant: MeterVariant,
}

impl MeterModel {
    pub const fn code(&self) -> u32 {
        match (self.rating, self.variant) {
            (MeterRating::A100, MeterVariant::TwoTs) => 1_200_094,
            (MeterRating::A100, MeterVariant::Modbus) => 1_200_126,
            (MeterRating::A100, MeterVariant::MBus) => 1_200_222,
            (MeterRating::A80, MeterVariant::TwoTs) => 1_200_093,
            (MeterRating::A80, MeterVariant::Modbus) => 1_200_125,
            (MeterRating::A80, MeterVariant::MBus) => 1_200_221,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn function_code_conversions() {
        // Converting to u8 and back must land on the same function code.
        for code in FunctionCode::iter() {
            assert_eq!(FunctionCode::try_from(code as u8), Ok(code));
        }
        assert_eq!(FunctionCode::try_from(0x83), Err(0x83));
    }

    #[test]
    fn registers_do_not_overlap() {
        // Each float register occupies two addresses.
        let mut addresses: Vec<u16> = MeterRegister::iter()
            .filter(|r| *r != MeterRegister::Measurements)
            .map(u16::from)
            .collect();
        addresses.sort();
        for pair in addresses.windows(2) {
            assert!(pair[1] - pair[0] >= 2, "{:#06X} overlaps {:#06X}", pair[0], pair[1]);
        }
    }

    #[test]
    fn model_codes_are_unique() {
        let mut codes = Vec::new();
        for rating in MeterRating::iter() {
            for variant in MeterVariant::iter() {
                codes.push(MeterModel { rating, variant }.code());
            }
        }
        let count = codes.len();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), count);
    }

    #[test]
    fn model_names_parse() {
        assert_eq!(MeterRating::from_str("80A"), Ok(MeterRating::A80));
        assert_eq!(MeterVariant::from_str("modbus"), Ok(MeterVariant::Modbus));
        assert_eq!(MeterVariant::TwoTs.to_string(), "2TS");
        assert_eq!(
            MeterModel {
                rating: MeterRating::A100,
                variant: MeterVariant::Modbus
            }
            .code(),
            1_200_126
        );
    }
}
