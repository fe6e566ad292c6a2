mod element;
mod include;

pub use self::element::Element;
pub use self::include::load_xml_file;
