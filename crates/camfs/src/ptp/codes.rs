//! PTP code tables: container types, operations, responses, events and object formats.
//!
//! Every table keeps unknown values losslessly (`Other(u16)`), since cameras freely mix
//! vendor extensions into the standard ranges.

use serde::Serialize;

macro_rules! code_table {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A code this table does not name.
            Other(u16),
        }

        impl $name {
            pub fn from_code(code: u16) -> Self {
                match code {
                    $( $value => Self::$variant, )+
                    other => Self::Other(other),
                }
            }

            pub fn code(self) -> u16 {
                match self {
                    $( Self::$variant => $value, )+
                    Self::Other(code) => code,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )+
                    Self::Other(_) => "Other",
                }
            }
        }

        impl From<u16> for $name {
            fn from(code: u16) -> Self {
                Self::from_code(code)
            }
        }

        impl From<$name> for u16 {
            fn from(value: $name) -> u16 {
                value.code()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(0x{:04X})", self.name(), self.code())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u16(self.code())
            }
        }
    };
}

code_table! {
    /// Container type field of the 12-byte header.
    pub enum ContainerType {
        Command = 0x0001,
        Data = 0x0002,
        Response = 0x0003,
        Event = 0x0004,
    }
}

code_table! {
    /// Operation codes issued by the engine.
    pub enum OperationCode {
        GetDeviceInfo = 0x1001,
        OpenSession = 0x1002,
        CloseSession = 0x1003,
        GetStorageIds = 0x1004,
        GetStorageInfo = 0x1005,
        GetNumObjects = 0x1006,
        GetObjectHandles = 0x1007,
        GetObjectInfo = 0x1008,
        GetObject = 0x1009,
        GetThumb = 0x100A,
        DeleteObject = 0x100B,
        SendObjectInfo = 0x100C,
        SendObject = 0x100D,
        FormatStore = 0x100F,
        GetPartialObject = 0x101B,
        /// Canon's vendor partial read, same parameters as `GetPartialObject`.
        CanonGetPartialObject = 0x9107,
    }
}

code_table! {
    /// Response codes. Only `Ok` means success.
    pub enum ResponseCode {
        Ok = 0x2001,
        GeneralError = 0x2002,
        SessionNotOpen = 0x2003,
        InvalidTransactionId = 0x2004,
        OperationNotSupported = 0x2005,
        ParameterNotSupported = 0x2006,
        IncompleteTransfer = 0x2007,
        InvalidStorageId = 0x2008,
        InvalidObjectHandle = 0x2009,
        DevicePropNotSupported = 0x200A,
        InvalidObjectFormatCode = 0x200B,
        StoreFull = 0x200C,
        ObjectWriteProtected = 0x200D,
        StoreReadOnly = 0x200E,
        AccessDenied = 0x200F,
        NoThumbnailPresent = 0x2010,
        StoreNotAvailable = 0x2013,
        SpecificationByFormatUnsupported = 0x2014,
        NoValidObjectInfo = 0x2015,
        DeviceBusy = 0x2019,
        InvalidParentObject = 0x201A,
        InvalidParameter = 0x201D,
        SessionAlreadyOpen = 0x201E,
        TransactionCancelled = 0x201F,
        /// Canon reports "busy" with its own vendor code.
        CanonDeviceBusy = 0xA108,
    }
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

code_table! {
    /// Asynchronous event codes delivered on the interrupt channel.
    pub enum EventCode {
        CancelTransaction = 0x4001,
        ObjectAdded = 0x4002,
        ObjectRemoved = 0x4003,
        StoreAdded = 0x4004,
        StoreRemoved = 0x4005,
        DevicePropChanged = 0x4006,
        ObjectInfoChanged = 0x4007,
        DeviceInfoChanged = 0x4008,
        StoreFull = 0x400A,
        DeviceReset = 0x400B,
        StorageInfoChanged = 0x400C,
        CaptureComplete = 0x400D,
    }
}

code_table! {
    /// Object format codes carried in ObjectInfo datasets.
    pub enum ObjectFormat {
        Undefined = 0x3000,
        Association = 0x3001,
        Wav = 0x3008,
        Mp3 = 0x3009,
        Avi = 0x300A,
        Mpeg = 0x300B,
        QuickTime = 0x300D,
        ExifJpeg = 0x3801,
        Tiff = 0x380D,
        CanonCrw = 0xB101,
        CanonCr2 = 0xB103,
        CanonMov = 0xB104,
        CanonCr3 = 0xB108,
        CanonHeif = 0xB10B,
        Mp4 = 0xB982,
    }
}
